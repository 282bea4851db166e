//! TUI (Terminal User Interface) Module
//!
//! Full-screen dashboard sink. Redrawn on every report; on finish the
//! alternate screen is left and the final report is printed as text so it
//! stays in the scrollback.

use std::io::{self, Stdout};
use std::time::Duration;

use crossterm::{
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use tracing::warn;

use super::dashboard::{
    format_duration, group_thousands, DashboardReport, DashboardSink, Indicator, TextSink,
};
use crate::base::error::Result;

/// Dashboard sink drawing into a ratatui terminal.
pub struct TuiSink<B: Backend + Send> {
    terminal: Terminal<B>,
    alternate_screen: bool,
}

impl<B: Backend + Send> TuiSink<B> {
    /// Draw into an already set-up terminal.
    pub fn new(terminal: Terminal<B>) -> Self {
        Self {
            terminal,
            alternate_screen: false,
        }
    }

    pub fn terminal(&self) -> &Terminal<B> {
        &self.terminal
    }

    fn restore(&mut self) -> io::Result<()> {
        if self.alternate_screen {
            self.alternate_screen = false;
            execute!(io::stdout(), LeaveAlternateScreen)?;
            self.terminal.show_cursor()?;
        }
        Ok(())
    }
}

impl TuiSink<CrosstermBackend<Stdout>> {
    /// Take over stdout with the alternate screen.
    ///
    /// Raw mode is left off so Ctrl-C still reaches the signal handler.
    pub fn stdout() -> io::Result<Self> {
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.hide_cursor()?;
        terminal.clear()?;
        Ok(Self {
            terminal,
            alternate_screen: true,
        })
    }
}

impl<B: Backend + Send> DashboardSink for TuiSink<B> {
    fn render(&mut self, report: &DashboardReport) -> Result<()> {
        self.terminal.draw(|f| draw_ui(f, report))?;
        Ok(())
    }

    fn finish(&mut self, report: &DashboardReport) -> Result<()> {
        if self.alternate_screen {
            self.restore()?;
            TextSink::stdout().render(report)
        } else {
            self.render(report)
        }
    }
}

impl<B: Backend + Send> Drop for TuiSink<B> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

/// Draw the UI
fn draw_ui(f: &mut Frame, report: &DashboardReport) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(6),    // Workers table
            Constraint::Length(3), // Efficiency
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], report);
    draw_workers_table(f, chunks[1], report);
    draw_efficiency(f, chunks[2], report);
    draw_footer(f, chunks[3], report);
}

/// Draw the header with summary statistics
fn draw_header(f: &mut Frame, area: Rect, report: &DashboardReport) {
    let running_color = if report.is_degraded() {
        Color::Red
    } else {
        Color::Green
    };

    let header_text = vec![
        Line::from(vec![
            Span::styled(
                "╔ Detect Fleet Monitor ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
            Span::raw("╗"),
        ]),
        Line::from(vec![
            Span::raw("  Workers: "),
            Span::styled(
                format!("{}/{}", report.running, report.configured),
                Style::default()
                    .fg(running_color)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::raw(" running  │  Combined FPS: "),
            Span::styled(
                format!("{:.1}", report.combined_rate),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!(
                "  │  Frames: {}  │  Detections: {}",
                group_thousands(report.total_frames),
                group_thousands(report.total_detections)
            )),
        ]),
    ];

    let header = Paragraph::new(header_text).alignment(Alignment::Left);
    f.render_widget(header, area);
}

/// Draw the workers table
fn draw_workers_table(f: &mut Frame, area: Rect, report: &DashboardReport) {
    let header =
        "│ ID        │ Part │ State      │     Frames │    FPS │    Avg │ Detections │ Restarts │ Uptime   │";
    let separator =
        "├───────────┼──────┼────────────┼────────────┼────────┼────────┼────────────┼──────────┼──────────┤";

    let mut lines = vec![
        Line::from(Span::styled(
            header,
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::raw(separator)),
    ];

    for worker in &report.workers {
        let color = if !worker.liveness.is_running() {
            Color::Gray
        } else {
            match worker.indicator {
                Indicator::Good => Color::Green,
                Indicator::Degraded => Color::Yellow,
                Indicator::Poor => Color::Red,
            }
        };

        let partition = worker
            .partition
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let row_text = format!(
            "│ {:<9} │ {:>4} │ {:<10} │ {:>10} │ {:>6.1} │ {:>6.1} │ {:>10} │ {:>8} │ {:<8} │",
            format!("worker-{}", worker.index),
            partition,
            worker.liveness.label(),
            group_thousands(worker.total_frames),
            worker.current_rate,
            worker.average_rate,
            group_thousands(worker.total_detections),
            worker.restarts,
            format_duration(Duration::from_secs_f64(worker.uptime_secs)),
        );

        lines.push(Line::from(Span::styled(row_text, Style::default().fg(color))));
    }

    let table = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Workers"))
        .alignment(Alignment::Left);

    f.render_widget(table, area);
}

/// Draw the efficiency gauge
fn draw_efficiency(f: &mut Frame, area: Rect, report: &DashboardReport) {
    let ratio = (report.efficiency_pct / 100.0).clamp(0.0, 1.0);
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(format!(
            "Efficiency ({} FPS per worker)",
            report.fps_ceiling
        )))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(ratio)
        .label(format!("{:.1}%", report.efficiency_pct));

    f.render_widget(gauge, area);
}

/// Draw the footer
fn draw_footer(f: &mut Frame, area: Rect, report: &DashboardReport) {
    let mut spans = vec![
        Span::styled(
            "  Ctrl-C",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" stop  │  twice to force"),
    ];
    if report.is_degraded() {
        spans.push(Span::styled(
            format!(
                "  │  Only {}/{} workers running",
                report.running, report.configured
            ),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }
    if report.dropped_samples > 0 {
        spans.push(Span::raw(format!(
            "  │  dropped samples: {}",
            report.dropped_samples
        )));
    }

    let footer = Paragraph::new(Line::from(spans))
        .alignment(Alignment::Left)
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(footer, area);
}
