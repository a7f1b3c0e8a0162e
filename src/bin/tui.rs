mod tui_app;

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use tui_app::{
    format_age, format_category, format_opt_pct, format_pct, truncate, AppState, ConnectionStatus,
    ResultView,
};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(io::Error::other)?;

    let mut app = AppState::new(base_url);

    // Initial fetch before rendering
    app.refresh(&client).await;

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut results_state = TableState::default();
    results_state.select(None);

    let result = run_loop(&mut terminal, &mut app, &client, &mut results_state).await;

    // Restore terminal regardless of result
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut AppState,
    client: &reqwest::Client,
    results_state: &mut TableState,
) -> io::Result<()> {
    let refresh_interval = Duration::from_secs(5);
    let mut last_tick = std::time::Instant::now();

    loop {
        terminal.draw(|f| render(f, app, results_state))?;

        let timeout = refresh_interval
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let selected = results_state
                        .selected()
                        .and_then(|i| app.results.get(i))
                        .map(|r| r.ticker.clone());
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => return Ok(()),
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            app.refresh(client).await;
                            last_tick = std::time::Instant::now();
                        }
                        KeyCode::Char('s') => {
                            app.trigger_scan(client).await;
                            app.refresh(client).await;
                        }
                        KeyCode::Char('w') => {
                            if let Some(ticker) = selected {
                                if app.is_watched(&ticker) {
                                    app.unwatch(client, &ticker).await;
                                } else {
                                    app.watch(client, &ticker).await;
                                }
                                app.refresh(client).await;
                            }
                        }
                        KeyCode::Down | KeyCode::Char('j') => {
                            let max = app.results.len().saturating_sub(1);
                            let next = results_state.selected().map_or(0, |i| (i + 1).min(max));
                            results_state.select(Some(next));
                        }
                        KeyCode::Up | KeyCode::Char('k') => {
                            let prev = results_state
                                .selected()
                                .map_or(0, |i| i.saturating_sub(1));
                            results_state.select(Some(prev));
                        }
                        KeyCode::Esc => results_state.select(None),
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= refresh_interval {
            app.refresh(client).await;
            last_tick = std::time::Instant::now();
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, app: &AppState, results_state: &mut TableState) {
    let area = f.area();

    // Outer vertical split: header | body | footer
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // body
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, app, chunks[0]);
    render_body(f, app, results_state, chunks[1]);
    render_footer(f, app, chunks[2]);
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn render_header(f: &mut Frame, app: &AppState, area: Rect) {
    let (status_text, status_color) = match &app.status {
        ConnectionStatus::Connected => ("● connected".to_string(), Color::Green),
        ConnectionStatus::Connecting => ("◌ connecting".to_string(), Color::Yellow),
        ConnectionStatus::Error(e) => (format!("✗ {}", truncate(e, 40)), Color::Red),
    };

    let scan_text = if app.health.scan_running {
        format!("scanning {}/{}", app.health.scan_progress, app.health.scan_total)
    } else {
        app.health
            .last_scan_at
            .map_or("no scan yet".to_string(), |t| format!("last scan {}", format_age(t, now_secs())))
    };

    let tally = app.summary.as_ref().map_or("—".to_string(), |s| {
        format!(
            "{} {} | {} evaluated | {} hits ({} full, {} strong) | {} skipped | {} no daily",
            s.mode.as_deref().unwrap_or("?"),
            s.scan_id,
            s.evaluated,
            s.hits,
            s.full_hits,
            s.strong,
            s.skipped_no_data + s.skipped_short_history + s.skipped_price_floor,
            s.daily_missing,
        )
    });

    let p99 = app
        .health
        .fetch_p99_ms
        .map_or("—".to_string(), |v| format!("fetch p99 {v:.0}ms"));

    let title_spans = vec![
        Span::styled(
            " Retest Scanner  ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  "),
        Span::styled(scan_text, Style::default().fg(Color::White)),
        Span::raw("  │  "),
        Span::styled(tally, Style::default().fg(Color::White)),
        Span::raw("  │  "),
        Span::styled(p99, Style::default().fg(Color::DarkGray)),
    ];

    let paragraph = Paragraph::new(Line::from(title_spans))
        .block(Block::default().borders(Borders::ALL).border_style(
            Style::default().fg(Color::DarkGray),
        ));

    f.render_widget(paragraph, area);
}

fn render_body(f: &mut Frame, app: &AppState, results_state: &mut TableState, area: Rect) {
    // Horizontal split: results (60%) | detail + watchlist (40%)
    let halves = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(halves[1]);

    let selected = results_state.selected().and_then(|i| app.results.get(i));

    render_results_table(f, app, results_state, halves[0]);
    render_detail(f, selected, right[0]);
    render_watchlist(f, app, right[1]);
}

fn score_color(score: f64) -> Color {
    if score >= 80.0 {
        Color::Green
    } else if score >= 60.0 {
        Color::Yellow
    } else {
        Color::DarkGray
    }
}

fn header_row(labels: &[&'static str]) -> Row<'static> {
    let cells = labels
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    Row::new(cells).height(1)
}

fn panel(title: &'static str) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(Span::styled(
            title,
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
}

fn render_results_table(f: &mut Frame, app: &AppState, state: &mut TableState, area: Rect) {
    let header = header_row(&["#", "Ticker", "Score", "Cat", "Close", "vs 200W", "Structure", "Signals"]);

    let rows: Vec<Row> = app
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let watched = if app.is_watched(&r.ticker) { "★" } else { "" };
            Row::new(vec![
                Cell::from(format!("{}", i + 1)).style(Style::default().fg(Color::DarkGray)),
                Cell::from(format!("{}{watched}", r.ticker)),
                Cell::from(format!("{:.0}", r.normalized_score))
                    .style(Style::default().fg(score_color(r.normalized_score))),
                Cell::from(format_category(&r.category)),
                Cell::from(format!("{:.2}", r.setup.close)),
                Cell::from(format_pct(r.setup.dist_sma200_pct)),
                Cell::from(truncate(&r.structure.label, 18)).style(Style::default().fg(Color::Cyan)),
                Cell::from(truncate(&r.signal_summary, 34)).style(Style::default().fg(Color::DarkGray)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(4),
            Constraint::Length(7),
            Constraint::Length(5),
            Constraint::Length(6),
            Constraint::Length(9),
            Constraint::Length(8),
            Constraint::Length(18),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(panel(" RANKED RESULTS "))
    .row_highlight_style(
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );

    f.render_stateful_widget(table, area, state);
}

fn pass(ok: bool) -> Span<'static> {
    if ok {
        Span::styled("✓", Style::default().fg(Color::Green))
    } else {
        Span::styled("✗", Style::default().fg(Color::Red))
    }
}

fn detail_lines(r: &ResultView) -> Vec<Line<'static>> {
    let s = &r.setup;
    let mut lines = vec![
        Line::from(vec![
            Span::styled(
                format!("{} ", r.ticker),
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("{:.0}/100", r.normalized_score),
                Style::default().fg(score_color(r.normalized_score)),
            ),
            Span::raw(format!("  raw {:.0}  {}", r.raw_score, s.mode)),
        ]),
        Line::from(vec![
            Span::raw("weekly "),
            pass(r.weekly_pass),
            Span::raw("  daily "),
            pass(r.daily_pass),
        ]),
        Line::from(format!(
            "close {:.2}  vs 200W {}  vol ×{:.2}",
            s.close,
            format_pct(s.dist_sma200_pct),
            s.vol_ratio
        )),
    ];

    match (&s.subtype, s.prior_run_pct) {
        (Some(subtype), _) => lines.push(Line::from(format!(
            "{subtype} base, {} weeks in band",
            s.duration_weeks.unwrap_or(0)
        ))),
        (None, Some(run)) => lines.push(Line::from(format!(
            "run {run:.0}%  correction {:.0}%  slope {}",
            s.correction_pct.unwrap_or(0.0),
            s.slope_grade.as_deref().unwrap_or("—"),
        ))),
        _ => {}
    }

    lines.push(match &r.daily {
        Some(d) => {
            let dot = d
                .exhaustion
                .dot_days_ago
                .map_or(String::new(), |n| format!(" (dot {n}d ago)"));
            Line::from(format!(
                "ATR {:.1}%  vs 50D {}  exhaustion {}{dot}",
                d.atr_pct,
                format_pct(d.pct_from_sma50),
                d.exhaustion.stage,
            ))
        }
        None => Line::styled("no daily data", Style::default().fg(Color::DarkGray)),
    });
    lines.push(Line::from(format!(
        "structure {} ({:+})",
        r.structure.label, r.structure.points
    )));
    lines.push(Line::from(format!(
        "sector {} {} ({:+})",
        r.sector.name,
        format_opt_pct(r.sector.relative_return_pct),
        r.sector.points
    )));
    lines.push(Line::styled(
        r.signal_summary.clone(),
        Style::default().fg(Color::Cyan),
    ));
    lines
}

fn render_detail(f: &mut Frame, selected: Option<&ResultView>, area: Rect) {
    let lines = match selected {
        Some(r) => detail_lines(r),
        None => vec![Line::styled(
            "select a result with ↑↓",
            Style::default().fg(Color::DarkGray),
        )],
    };
    f.render_widget(Paragraph::new(lines).block(panel(" DETAIL ")), area);
}

fn render_watchlist(f: &mut Frame, app: &AppState, area: Rect) {
    let header = header_row(&["Ticker", "Score", "Close", "Sector", "Structure", "Added"]);
    let now = now_secs();

    let rows: Vec<Row> = app
        .watchlist
        .iter()
        .map(|w| {
            Row::new(vec![
                Cell::from(w.ticker.clone()),
                Cell::from(format!("{:.0}", w.score)).style(Style::default().fg(score_color(w.score))),
                Cell::from(format!("{:.2}", w.close)),
                Cell::from(truncate(&w.sector, 12)),
                Cell::from(truncate(&w.structure_label, 16)),
                Cell::from(format_age(w.added_at, now)).style(Style::default().fg(Color::DarkGray)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(7),
            Constraint::Length(5),
            Constraint::Length(9),
            Constraint::Length(12),
            Constraint::Min(8),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(panel(" WATCHLIST "));

    f.render_widget(table, area);
}

fn render_footer(f: &mut Frame, app: &AppState, area: Rect) {
    let mut spans = vec![
        Span::styled(" [q] ", Style::default().fg(Color::Yellow)),
        Span::raw("quit  "),
        Span::styled("[r] ", Style::default().fg(Color::Yellow)),
        Span::raw("refresh  "),
        Span::styled("[s] ", Style::default().fg(Color::Yellow)),
        Span::raw("scan now  "),
        Span::styled("[w] ", Style::default().fg(Color::Yellow)),
        Span::raw("watch/unwatch  "),
        Span::styled("[↑↓ / j k] ", Style::default().fg(Color::Yellow)),
        Span::raw("select  "),
    ];
    match &app.flash {
        Some(msg) => spans.push(Span::styled(msg.clone(), Style::default().fg(Color::Cyan))),
        None => spans.push(Span::styled(
            format!("auto-refresh: 5s (updated {}s ago)", app.last_refresh.elapsed().as_secs()),
            Style::default().fg(Color::DarkGray),
        )),
    }
    let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().fg(Color::White));
    f.render_widget(paragraph, area);
}
