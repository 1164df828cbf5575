use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    symbols::Marker,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Clear, Dataset, GraphType, Paragraph, Wrap},
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::arima::{ArimaOrder, MAX_D, MAX_P, MAX_Q};
use crate::error::ForecastError;
use crate::forecast::{ForecastReport, ForecastRequest, ForecastService, MAX_HORIZON, MIN_HORIZON};
use crate::price_history::{HistoryPeriod, PriceSource};
use crate::storage_utils::DashboardConfig;

// --- App State ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Ticker,
    Period,
    Horizon,
    P,
    D,
    Q,
}

impl Field {
    const ALL: [Field; 6] = [Field::Ticker, Field::Period, Field::Horizon, Field::P, Field::D, Field::Q];

    fn label(&self) -> &'static str {
        match self {
            Field::Ticker => "Ticker",
            Field::Period => "History Period",
            Field::Horizon => "Forecast Days",
            Field::P => "p (AR)",
            Field::D => "d (I)",
            Field::Q => "q (MA)",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Status {
    Idle,
    Running,
    Warning(String),
    Error(String),
    Success,
}

#[derive(Debug, PartialEq)]
enum Action {
    Continue,
    Quit,
    Render(ForecastRequest),
}

struct App {
    ticker: String,
    period: HistoryPeriod,
    horizon: usize,
    order: ArimaOrder,
    focus: usize,
    status: Status,
    report: Option<ForecastReport>,
}

impl App {
    fn new(config: &DashboardConfig) -> Self {
        Self {
            ticker: config.default_symbol.clone(),
            period: config.default_period,
            horizon: config.forecast_days.clamp(MIN_HORIZON, MAX_HORIZON),
            order: ArimaOrder {
                p: config.order.p.min(MAX_P),
                d: config.order.d.min(MAX_D),
                q: config.order.q.min(MAX_Q),
            },
            focus: 0,
            status: Status::Idle,
            report: None,
        }
    }

    fn focused(&self) -> Field {
        Field::ALL[self.focus]
    }

    fn is_refreshing(&self) -> bool {
        self.status == Status::Running
    }

    fn request(&self) -> ForecastRequest {
        ForecastRequest {
            symbol: self.ticker.clone(),
            period: self.period,
            horizon: self.horizon,
            order: self.order,
        }
    }

    fn value_text(&self, field: Field) -> String {
        match field {
            Field::Ticker => self.ticker.clone(),
            Field::Period => self.period.to_string(),
            Field::Horizon => self.horizon.to_string(),
            Field::P => self.order.p.to_string(),
            Field::D => self.order.d.to_string(),
            Field::Q => self.order.q.to_string(),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Esc => return Action::Quit,
            KeyCode::Char('q') if self.focused() != Field::Ticker => return Action::Quit,
            KeyCode::Tab | KeyCode::Down => self.focus = (self.focus + 1) % Field::ALL.len(),
            KeyCode::BackTab | KeyCode::Up => {
                self.focus = self.focus.checked_sub(1).unwrap_or(Field::ALL.len() - 1);
            }
            KeyCode::Left => self.adjust(-1),
            KeyCode::Right => self.adjust(1),
            KeyCode::Backspace if self.focused() == Field::Ticker => {
                self.ticker.pop();
            }
            KeyCode::Enter | KeyCode::F(5) if !self.is_refreshing() => return self.submit(),
            KeyCode::Char(c) => self.type_char(c),
            _ => {}
        }
        Action::Continue
    }

    /// Input errors stop here; only a valid request is handed to the render task.
    fn submit(&mut self) -> Action {
        let request = self.request();
        if let Err(e) = request.validate() {
            self.apply_result(Err(e));
            return Action::Continue;
        }
        self.status = Status::Running;
        Action::Render(request)
    }

    fn adjust(&mut self, delta: i64) {
        match self.focused() {
            Field::Ticker => {}
            Field::Period => {
                self.period = if delta > 0 { self.period.next() } else { self.period.previous() };
            }
            Field::Horizon => self.horizon = step_within(self.horizon, delta, MIN_HORIZON, MAX_HORIZON),
            Field::P => self.order.p = step_within(self.order.p, delta, 0, MAX_P),
            Field::D => self.order.d = step_within(self.order.d, delta, 0, MAX_D),
            Field::Q => self.order.q = step_within(self.order.q, delta, 0, MAX_Q),
        }
    }

    fn type_char(&mut self, c: char) {
        let field = self.focused();
        if field == Field::Ticker {
            if !c.is_control() {
                self.ticker.push(c);
            }
            return;
        }

        let Some(digit) = c.to_digit(10).map(|d| d as usize) else {
            return;
        };
        match field {
            Field::Period if (1..=HistoryPeriod::ALL.len()).contains(&digit) => {
                self.period = HistoryPeriod::ALL[digit - 1];
            }
            Field::P if digit <= MAX_P => self.order.p = digit,
            Field::D if digit <= MAX_D => self.order.d = digit,
            Field::Q if digit <= MAX_Q => self.order.q = digit,
            _ => {}
        }
    }

    fn apply_result(&mut self, result: Result<ForecastReport, ForecastError>) {
        match result {
            Ok(report) => {
                self.report = Some(report);
                self.status = Status::Success;
            }
            Err(e) => {
                // Nothing is charted for a failed cycle.
                self.report = None;
                self.status = if e.is_warning() {
                    Status::Warning(e.to_string())
                } else {
                    warn!(error = %e, "render cycle failed");
                    Status::Error(e.to_string())
                };
            }
        }
    }
}

fn step_within(value: usize, delta: i64, min: usize, max: usize) -> usize {
    (value as i64 + delta).clamp(min as i64, max as i64) as usize
}

// --- TUI ---

pub async fn run_tui<S>(service: Arc<ForecastService<S>>, config: &DashboardConfig) -> Result<()>
where
    S: PriceSource + Send + Sync + 'static,
{
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, App::new(config), service).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    res
}

async fn run_app<B, S>(terminal: &mut Terminal<B>, mut app: App, service: Arc<ForecastService<S>>) -> Result<()>
where
    B: Backend,
    S: PriceSource + Send + Sync + 'static,
{
    let (result_tx, mut result_rx) = mpsc::channel::<Result<ForecastReport, ForecastError>>(1);

    // First render with the configured defaults, like opening the page.
    if let Action::Render(request) = app.submit() {
        spawn_render(&service, request, &result_tx);
    }

    loop {
        terminal.draw(|f| ui(f, &app))?;

        if let Ok(result) = result_rx.try_recv() {
            app.apply_result(result);
        }

        if event::poll(Duration::from_millis(50))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => match app.handle_key(key) {
                    Action::Quit => return Ok(()),
                    Action::Render(request) => spawn_render(&service, request, &result_tx),
                    Action::Continue => {}
                },
                // terminal.draw() picks up the new size on the next iteration.
                Event::Resize(_, _) => {}
                _ => {}
            }
        }
    }
}

fn spawn_render<S>(
    service: &Arc<ForecastService<S>>,
    request: ForecastRequest,
    tx: &mpsc::Sender<Result<ForecastReport, ForecastError>>,
) where
    S: PriceSource + Send + Sync + 'static,
{
    let service = Arc::clone(service);
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = run_guarded(service, request).await;
        let _ = tx.send(result).await;
    });
}

/// Runs one cycle on its own task so a panic still reports back instead of
/// leaving the dashboard in `Running`.
async fn run_guarded<S>(service: Arc<ForecastService<S>>, request: ForecastRequest) -> Result<ForecastReport, ForecastError>
where
    S: PriceSource + Send + Sync + 'static,
{
    tokio::spawn(async move { service.run(&request).await })
        .await
        .unwrap_or_else(|e| Err(ForecastError::Worker(e)))
}

// --- Chart data ---

fn history_points(report: &ForecastReport) -> Vec<(f64, f64)> {
    report
        .series
        .points
        .iter()
        .enumerate()
        .map(|(i, p)| (i as f64, p.close))
        .collect()
}

fn fitted_points(report: &ForecastReport) -> Vec<(f64, f64)> {
    report
        .fitted
        .iter()
        .enumerate()
        .map(|(i, (_, value))| ((i + 1) as f64, *value))
        .collect()
}

/// Forecast line, anchored on the last actual close so it joins the history.
fn forecast_points(report: &ForecastReport) -> Vec<(f64, f64)> {
    let n = report.series.len();
    let anchor = report.series.points.last().map(|p| ((n - 1) as f64, p.close));
    anchor
        .into_iter()
        .chain(
            report
                .forecast
                .iter()
                .enumerate()
                .map(|(k, f)| ((n + k) as f64, f.step.mean)),
        )
        .collect()
}

/// Dense scatter between the interval bounds; drawn first so lines sit on top.
fn band_points(report: &ForecastReport) -> Vec<(f64, f64)> {
    const COLUMNS: usize = 5;
    const ROWS: usize = 12;
    let n = report.series.len();
    let mut points = Vec::with_capacity(report.forecast.len() * COLUMNS * (ROWS + 1));
    for (k, f) in report.forecast.iter().enumerate() {
        let x = (n + k) as f64;
        for c in 0..COLUMNS {
            let dx = (c as f64 / (COLUMNS - 1) as f64 - 0.5) * 0.8;
            for r in 0..=ROWS {
                let y = f.step.lower + (f.step.upper - f.step.lower) * r as f64 / ROWS as f64;
                points.push((x + dx, y));
            }
        }
    }
    points
}

fn y_bounds(sets: &[&[(f64, f64)]]) -> [f64; 2] {
    let (min, max) = sets
        .iter()
        .flat_map(|s| s.iter())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, y)| (lo.min(*y), hi.max(*y)));
    if !min.is_finite() || !max.is_finite() {
        return [0.0, 1.0];
    }
    let pad = ((max - min) * 0.05).max(max.abs() * 0.001).max(1e-6);
    [min - pad, max + pad]
}

fn y_labels(bounds: [f64; 2]) -> Vec<Span<'static>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::raw(format!("{:.2}", v)))
        .collect()
}

// --- Rendering ---

fn ui(f: &mut Frame, app: &App) {
    let main_layout = Layout::horizontal([Constraint::Percentage(22), Constraint::Percentage(78)]).split(f.size());

    render_sidebar(f, app, main_layout[0]);

    let right_chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Percentage(45),
        Constraint::Min(0),
    ])
    .split(main_layout[1]);

    let (status_text, status_style) = match &app.status {
        Status::Idle => ("Press Enter to generate a forecast".to_string(), Style::default()),
        Status::Running => ("Training ARIMA model...".to_string(), Style::default().fg(Color::Yellow)),
        Status::Warning(msg) => (format!("Warning: {}", msg), Style::default().fg(Color::Yellow)),
        Status::Error(msg) => (format!("Error: {}", msg), Style::default().fg(Color::Red)),
        Status::Success => ("Forecast generated successfully".to_string(), Style::default().fg(Color::Green)),
    };
    f.render_widget(
        Paragraph::new(Line::from(status_text).style(status_style)).block(
            Block::default()
                .borders(Borders::ALL)
                .title_alignment(Alignment::Center)
                .title(format!("Selected Symbol: {}", app.ticker.trim())),
        ),
        right_chunks[0],
    );

    match &app.report {
        Some(report) => {
            render_history_chart(f, report, right_chunks[1]);
            render_forecast_chart(f, report, right_chunks[2]);
        }
        None => {
            for (area, title) in [
                (right_chunks[1], "Historical Closing Prices"),
                (right_chunks[2], "Historical Prediction and Forecast"),
            ] {
                f.render_widget(
                    Paragraph::new("No data").alignment(Alignment::Center).block(
                        Block::default().borders(Borders::ALL).title(title),
                    ),
                    area,
                );
            }
        }
    }

    if app.is_refreshing() {
        let area = centered_rect(50, 20, main_layout[1]);
        f.render_widget(Clear, area);
        f.render_widget(
            Paragraph::new("Training ARIMA model...\nPlease wait.")
                .block(Block::default().title("Forecasting").borders(Borders::ALL))
                .alignment(Alignment::Center),
            area,
        );
    }
}

fn render_sidebar(f: &mut Frame, app: &App, area: Rect) {
    let sidebar_block = Block::default()
        .borders(Borders::ALL)
        .title("Inputs")
        .title_alignment(Alignment::Center);
    let inner_sidebar_area = sidebar_block.inner(area);
    f.render_widget(sidebar_block, area);

    let sidebar_chunks = Layout::vertical([
        Constraint::Min(1),    // For the inputs
        Constraint::Length(6), // For the key help
    ])
    .split(inner_sidebar_area);

    let mut lines: Vec<Line> = Vec::new();
    for (i, field) in Field::ALL.iter().enumerate() {
        let focused = i == app.focus;
        let label_style = if focused {
            Style::default().fg(Color::Yellow).bg(Color::DarkGray)
        } else {
            Style::default().fg(Color::Gray)
        };
        let value = match field {
            Field::Ticker if focused => format!("{}_", app.value_text(*field)),
            Field::Ticker => app.value_text(*field),
            _ => format!("< {} >", app.value_text(*field)),
        };
        lines.push(Line::from(field.label()).style(label_style));
        lines.push(Line::from(format!("  {}", value)).style(Style::default().fg(Color::Cyan)));
        lines.push(Line::from(""));
    }
    f.render_widget(Paragraph::new(lines), sidebar_chunks[0]);

    f.render_widget(
        Paragraph::new("Tab/Up/Down: move\nLeft/Right: adjust\nEnter/F5: forecast\nEsc: quit")
            .wrap(Wrap { trim: true })
            .style(Style::default().fg(Color::DarkGray)),
        sidebar_chunks[1],
    );
}

fn date_labels(report: &ForecastReport, include_forecast: bool) -> Vec<Span<'static>> {
    let points = &report.series.points;
    let first = points.first().map(|p| p.date);
    let middle = points.get(points.len() / 2).map(|p| p.date);
    let last = if include_forecast {
        report.forecast.last().map(|f| f.date)
    } else {
        points.last().map(|p| p.date)
    };
    [first, middle, last]
        .into_iter()
        .flatten()
        .map(|d| Span::raw(d.format("%d-%m-%Y").to_string()))
        .collect()
}

fn render_history_chart(f: &mut Frame, report: &ForecastReport, area: Rect) {
    let history = history_points(report);
    let y = y_bounds(&[history.as_slice()]);
    let x_max = history.len().saturating_sub(1).max(1) as f64;

    let datasets = vec![
        Dataset::default()
            .name(format!("{} Close", report.series.symbol))
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Cyan))
            .data(&history),
    ];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title("Historical Closing Prices"))
        .x_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, x_max])
                .labels(date_labels(report, false)),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds(y)
                .labels(y_labels(y)),
        );
    f.render_widget(chart, area);
}

fn render_forecast_chart(f: &mut Frame, report: &ForecastReport, area: Rect) {
    let history = history_points(report);
    let fitted = fitted_points(report);
    let forecast = forecast_points(report);
    let band = band_points(report);
    let y = y_bounds(&[history.as_slice(), fitted.as_slice(), forecast.as_slice(), band.as_slice()]);
    let x_max = (history.len() + report.forecast.len()) as f64;

    let datasets = vec![
        Dataset::default()
            .name(format!("{:.0}% Confidence Interval", report.confidence * 100.0))
            .marker(Marker::Braille)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::DarkGray))
            .data(&band),
        Dataset::default()
            .name("Actual")
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Cyan))
            .data(&history),
        Dataset::default()
            .name("Predicted (Historical)")
            .marker(Marker::Dot)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::Yellow))
            .data(&fitted),
        Dataset::default()
            .name("Forecast")
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
            .data(&forecast),
    ];

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("Historical Prediction and Forecast, ARIMA{}", report.model.order())),
        )
        .x_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, x_max])
                .labels(date_labels(report, true)),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds(y)
                .labels(y_labels(y)),
        );
    f.render_widget(chart, area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .split(r);
    Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_history::PriceSeries;
    use crossterm::event::KeyModifiers;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn app() -> App {
        App::new(&DashboardConfig::default())
    }

    fn focus(app: &mut App, field: Field) {
        while app.focused() != field {
            app.handle_key(key(KeyCode::Tab));
        }
    }

    #[test]
    fn defaults_come_from_config() {
        let app = app();
        assert_eq!(app.ticker, "RELIANCE.NS");
        assert_eq!(app.period, HistoryPeriod::OneYear);
        assert_eq!(app.horizon, 7);
        assert_eq!(app.order, ArimaOrder { p: 5, d: 1, q: 5 });
    }

    #[test]
    fn empty_ticker_warns_and_does_not_render() {
        let mut app = app();
        while !app.ticker.is_empty() {
            app.handle_key(key(KeyCode::Backspace));
        }

        let action = app.handle_key(key(KeyCode::Enter));

        assert_eq!(action, Action::Continue);
        assert!(matches!(app.status, Status::Warning(_)));
        assert!(app.report.is_none());
    }

    #[test]
    fn typing_edits_ticker_including_q() {
        let mut app = app();
        app.ticker.clear();
        for c in "QQQ".chars() {
            assert_eq!(app.handle_key(key(KeyCode::Char(c))), Action::Continue);
        }

        match app.handle_key(key(KeyCode::Enter)) {
            Action::Render(request) => assert_eq!(request.symbol, "QQQ"),
            other => panic!("expected render, got {:?}", other),
        }
        assert!(app.is_refreshing());
        // A second submit while running is ignored.
        assert_eq!(app.handle_key(key(KeyCode::Enter)), Action::Continue);
    }

    #[test]
    fn sliders_stay_within_bounds() {
        let mut app = app();

        focus(&mut app, Field::Horizon);
        for _ in 0..20 {
            app.handle_key(key(KeyCode::Right));
        }
        assert_eq!(app.horizon, MAX_HORIZON);
        for _ in 0..20 {
            app.handle_key(key(KeyCode::Left));
        }
        assert_eq!(app.horizon, MIN_HORIZON);

        focus(&mut app, Field::D);
        for _ in 0..5 {
            app.handle_key(key(KeyCode::Right));
        }
        assert_eq!(app.order.d, MAX_D);
        app.handle_key(key(KeyCode::Char('9')));
        assert_eq!(app.order.d, MAX_D);
        app.handle_key(key(KeyCode::Char('0')));
        assert_eq!(app.order.d, 0);
    }

    #[test]
    fn period_selector_cycles_and_quits_outside_ticker() {
        let mut app = app();
        focus(&mut app, Field::Period);

        app.handle_key(key(KeyCode::Right));
        assert_eq!(app.period, HistoryPeriod::TwoYears);
        app.handle_key(key(KeyCode::Char('1')));
        assert_eq!(app.period, HistoryPeriod::SixMonths);

        assert_eq!(app.handle_key(key(KeyCode::Char('q'))), Action::Quit);
        assert_eq!(app.handle_key(key(KeyCode::Esc)), Action::Quit);
    }

    #[test]
    fn failed_cycle_clears_previous_chart() {
        let mut app = app();
        app.apply_result(Err(ForecastError::NoData {
            symbol: "NOPE".to_string(),
        }));

        assert!(app.report.is_none());
        assert!(matches!(app.status, Status::Error(ref msg) if msg.contains("NOPE")));
    }

    struct CrashingSource;

    impl PriceSource for CrashingSource {
        async fn fetch_close(&self, _symbol: &str, _period: HistoryPeriod) -> anyhow::Result<PriceSeries> {
            panic!("feed crashed")
        }
    }

    #[tokio::test]
    async fn panicking_render_reports_an_error_and_unlocks_submit() {
        let service = Arc::new(ForecastService::new(CrashingSource, Duration::from_secs(300), 0.95));
        let (tx, mut rx) = mpsc::channel(1);
        let mut app = app();
        let Action::Render(request) = app.submit() else {
            panic!("expected a render");
        };
        assert!(app.is_refreshing());

        spawn_render(&service, request, &tx);
        let result = rx.recv().await.unwrap();

        assert!(matches!(result, Err(ForecastError::Worker(_))));
        app.apply_result(result);
        assert!(matches!(app.status, Status::Error(_)));
        assert!(matches!(app.handle_key(key(KeyCode::Enter)), Action::Render(_)));
    }

    #[test]
    fn y_bounds_pad_the_range() {
        let low_high = [(0.0, 10.0), (1.0, 20.0)];
        let middle = [(2.0, 15.0)];
        let bounds = y_bounds(&[low_high.as_slice(), middle.as_slice()]);
        assert!(bounds[0] < 10.0 && bounds[1] > 20.0);
        assert_eq!(y_bounds(&[]), [0.0, 1.0]);
    }
}
