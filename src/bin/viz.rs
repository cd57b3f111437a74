/// ptxverify live monitor: attach to a running verification at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz [-- /path/to/snapshot.json]
///
/// Start the verifier with `--live` (optionally `--live PATH`). The monitor
/// polls the snapshot file every 200ms and renders:
///
///     ┌ header: kernel / block / mode / status ─────────────────────┐
///     │ Pipeline: stage gauge + per-stage timings │ Stats: counts   │
///     │ q/esc: quit  …footer…                                       │
///
/// Press q or Esc to quit. The verifier keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ptxverify::metrics::{default_path, read_metrics, LiveMetrics};
use ptxverify::report::Stage;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_path);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &path);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics(path);
        terminal.draw(|f| render(f, metrics.as_ref(), path))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>, path: &Path) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // pipeline + stats
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(rows[1]);

    render_pipeline(f, cols[0], metrics);
    render_stats(f, cols[1], metrics);
    render_footer(f, rows[2], path);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " ptxverify live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (name, block_dim, mode, status) = metrics
        .map(|m| {
            (
                m.kernel_name.as_str(),
                format!("({},{},{})", m.block[0], m.block[1], m.block[2]),
                if m.lock_step { "warp lock-step" } else { "scalar" },
                m.status.as_str(),
            )
        })
        .unwrap_or(("-", "-".to_string(), "-", "idle"));

    let status_color = match status {
        "running" => Color::Green,
        "complete" => Color::Cyan,
        "failed" => Color::Red,
        _ => Color::DarkGray,
    };

    let spans = vec![
        Span::styled("  kernel: ", Style::default().fg(Color::DarkGray)),
        Span::styled(name, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   block: ", Style::default().fg(Color::DarkGray)),
        Span::raw(block_dim),
        Span::styled("   mode: ", Style::default().fg(Color::DarkGray)),
        Span::styled(mode, Style::default().fg(Color::Cyan)),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
    ];

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

// ---------------------------------------------------------------------------
// Pipeline panel
// ---------------------------------------------------------------------------

fn render_pipeline(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Pipeline ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // progress gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // stage list
        ])
        .split(inner);

    let Some(m) = metrics else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No verification running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start ptxverify with --live to see live data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    let pct = (m.progress() * 100.0).round() as u16;
    let gauge_color = if m.status == "failed" { Color::Red } else { Color::Blue };
    let gauge = Gauge::default()
        .block(Block::default().title("Stages"))
        .gauge_style(Style::default().fg(gauge_color))
        .percent(pct.min(100))
        .label(format!("{} / {}", m.stages_completed, m.stages_total));
    f.render_widget(gauge, rows[0]);

    // One line per stage: done with its time, running, or pending
    let lines: Vec<Line> = Stage::ALL
        .iter()
        .map(|stage| {
            let timing = m.timings.iter().find(|t| t.stage == stage.name());
            let (marker, color, detail) = match timing {
                Some(t) => ("✔", Color::Green, format!("{:>10.3} ms", t.millis)),
                None if m.stage == stage.name() && m.status == "running" => {
                    ("▶", Color::Yellow, "running".to_string())
                }
                None if m.stage == stage.name() && m.status == "failed" => {
                    ("✘", Color::Red, "failed".to_string())
                }
                None => ("·", Color::DarkGray, String::new()),
            };
            Line::from(vec![
                Span::styled(format!("  {marker} "), Style::default().fg(color)),
                Span::styled(format!("{:<10}", stage.name()), Style::default().fg(color)),
                Span::raw(detail),
            ])
        })
        .collect();
    f.render_widget(Paragraph::new(lines), rows[2]);
}

// ---------------------------------------------------------------------------
// Stats panel
// ---------------------------------------------------------------------------

fn stat_line(label: &'static str, value: String, color: Color) -> Line<'static> {
    Line::from(vec![
        Span::styled(label, Style::default().fg(Color::DarkGray)),
        Span::styled(value, Style::default().fg(color)),
    ])
}

fn render_stats(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Stats ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let Some(m) = metrics else {
        return;
    };

    let alarm = |n: usize| if n > 0 { Color::Red } else { Color::Green };
    let text = vec![
        stat_line("Threads:       ", m.threads.to_string(), Color::White),
        stat_line("Warps:         ", m.warps.to_string(), Color::White),
        stat_line("Pool workers:  ", m.pool_size.to_string(), Color::White),
        Line::raw(""),
        stat_line("Instructions:  ", m.dynamic_instructions.to_string(), Color::White),
        stat_line("Shared access: ", m.shared_accesses.to_string(), Color::White),
        stat_line("Barriers:      ", m.barrier_instances.to_string(), Color::White),
        Line::raw(""),
        stat_line("Races:         ", m.races.to_string(), alarm(m.races)),
        stat_line(
            "Barrier errors:",
            format!(" {}", m.barrier_findings),
            alarm(m.barrier_findings),
        ),
    ];
    f.render_widget(Paragraph::new(text), inner);
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect, path: &Path) {
    let text = Paragraph::new(Span::styled(
        format!(
            "  q / esc: quit    auto-refreshes every 200ms    reads {}",
            path.display()
        ),
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
