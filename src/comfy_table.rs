use crate::candle::{CandleRecord, TIME_FORMAT};
use crate::forecast::ForecastReport;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

fn base_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().enumerate().map(|(i, h)| {
            let cell = Cell::new(h).add_attribute(Attribute::Bold);
            if i == 0 { cell } else { cell.set_alignment(CellAlignment::Right) }
        }));
    table
}

fn number(value: f64) -> Cell {
    Cell::new(format!("{:.2}", value)).set_alignment(CellAlignment::Right)
}

/// Last `count` rows of the candle table, oldest first.
pub fn candle_tail(rows: &[CandleRecord], count: usize) -> Table {
    let mut table = base_table(&["Time (UTC)", "Open", "High", "Low", "Close", "Volume"]);

    for row in &rows[rows.len().saturating_sub(count)..] {
        let close_color = if row.close >= row.open { Color::Green } else { Color::Red };
        table.add_row(vec![
            Cell::new(row.time.format(TIME_FORMAT)).fg(Color::DarkGrey),
            number(row.open),
            number(row.high),
            number(row.low),
            number(row.close).fg(close_color),
            Cell::new(format!("{:.4}", row.volume)).set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

pub fn forecast_table(report: &ForecastReport) -> Table {
    let level = format!("{:.0}%", report.confidence * 100.0);
    let mut table = base_table(&["Date", "Forecast", &format!("Lower {}", level), &format!("Upper {}", level)]);

    for row in &report.forecast {
        table.add_row(vec![
            Cell::new(row.date.format("%a %d-%m-%Y")).fg(Color::Rgb { r: 0, g: 200, b: 200 }),
            number(row.step.mean).fg(Color::Green).add_attribute(Attribute::Bold),
            number(row.step.lower).fg(Color::DarkGrey),
            number(row.step.upper).fg(Color::DarkGrey),
        ]);
    }
    table
}

/// One-line model summary printed above the forecast table.
pub fn model_summary(report: &ForecastReport) -> String {
    let model = &report.model;
    let fmt = |coeffs: &[f64]| {
        coeffs
            .iter()
            .map(|c| format!("{:.3}", c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "ARIMA{} on {} closes | AR [{}] | MA [{}] | sigma^2 {:.4}",
        model.order(),
        report.series.len(),
        fmt(model.ar_coefficients()),
        fmt(model.ma_coefficients()),
        model.sigma2()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_shows_only_latest_rows() {
        let rows: Vec<CandleRecord> = (0..8)
            .map(|i| {
                CandleRecord::from_open_time_ms(1_700_000_040_000 + i * 60_000, 1.0, 2.0, 0.5, 1.5 + i as f64, 3.0)
                    .unwrap()
            })
            .collect();

        let rendered = candle_tail(&rows, 5).to_string();

        assert!(!rendered.contains("3.50"));
        assert!(rendered.contains("4.50"));
        assert!(rendered.contains("8.50"));
        assert!(rendered.contains("Close"));
    }

    #[test]
    fn tail_of_short_table_shows_everything() {
        let rows = vec![CandleRecord::from_open_time_ms(1_700_000_040_000, 1.0, 2.0, 0.5, 1.5, 3.0).unwrap()];
        assert!(candle_tail(&rows, 5).to_string().contains("2023-11-14 22:14:00"));
    }
}
