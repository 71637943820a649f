//! Readers for the event list and the batch filter file.

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::parse_optional_f64;
use crate::error::{AppError, Result};
use crate::types::{parse_event_time, FilterConfig, MarketEvent, ValueBand};

#[derive(Debug, Deserialize)]
struct EventRow {
    #[serde(default)]
    name: Option<String>,
    date_time: String,
    change_percent: String,
}

#[derive(Debug, Deserialize)]
struct BatchRow {
    name: String,
    #[serde(default)]
    min_transfer: String,
    #[serde(default)]
    max_transfer: String,
    #[serde(default)]
    time_before_event: String,
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .comment(Some(b'#'))
        .from_path(path)?)
}

/// Market events in file order. Rows with an unreadable time or change are
/// skipped with a warning; the rest of the list still loads.
pub fn load_events(path: impl AsRef<Path>) -> Result<Vec<MarketEvent>> {
    let path = path.as_ref();
    let mut events = Vec::new();
    for (line, row) in reader(path)?.deserialize::<EventRow>().enumerate() {
        let row = row?;
        let Some(timestamp) = parse_event_time(&row.date_time) else {
            warn!(line = line + 2, date_time = %row.date_time, "unreadable event time, row skipped");
            continue;
        };
        let Ok(percent_change) = row.change_percent.trim_end_matches('%').trim().parse::<f64>() else {
            warn!(line = line + 2, change = %row.change_percent, "unreadable price change, row skipped");
            continue;
        };
        events.push(MarketEvent {
            timestamp,
            percent_change,
            name: row.name.filter(|n| !n.is_empty()),
        });
    }
    info!(path = %path.display(), count = events.len(), "events loaded");
    Ok(events)
}

/// Batch filters. Empty or `none` fields fall back to `default_band` /
/// `default_lookback_secs`, except `max_transfer: none`, which leaves the band open.
pub fn load_filters(
    path: impl AsRef<Path>,
    default_band: ValueBand,
    default_lookback_secs: i64,
) -> Result<Vec<FilterConfig>> {
    let path = path.as_ref();
    let mut filters = Vec::new();
    for row in reader(path)?.deserialize::<BatchRow>() {
        let row = row?;
        let bad = |field: &str, raw: &str| {
            AppError::Configuration(format!("batch '{}': {field} {raw:?} is not a number", row.name))
        };

        let min = parse_optional_f64(&row.min_transfer)
            .map_err(|_| bad("min_transfer", &row.min_transfer))?
            .unwrap_or(default_band.min);
        let max = parse_optional_f64(&row.max_transfer).map_err(|_| bad("max_transfer", &row.max_transfer))?;
        let lookback_secs = match row.time_before_event.to_ascii_lowercase().as_str() {
            "" | "none" => default_lookback_secs,
            raw => raw.parse::<i64>().map_err(|_| bad("time_before_event", raw))?,
        };

        filters.push(FilterConfig {
            name: row.name.clone(),
            band: ValueBand { min, max },
            lookback_secs,
        });
    }
    info!(path = %path.display(), count = filters.len(), "batch filters loaded");
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn events_accept_both_date_styles_and_skip_bad_rows() {
        let f = file(
            "name,date_time,change_percent\n\
             crash,2024/08/27 20:23:00,-3.7\n\
             pump,2024-09-01 08:00:00,2.1%\n\
             broken,sometime,1.0\n",
        );
        let events = load_events(f.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_time(), "2024-08-27T20:23:00Z");
        assert_eq!(events[0].percent_change, -3.7);
        assert_eq!(events[0].name.as_deref(), Some("crash"));
        assert_eq!(events[1].percent_change, 2.1);
    }

    #[test]
    fn batch_rows_fill_defaults() {
        let f = file(
            "name,min_transfer,max_transfer,time_before_event\n\
             whales,1000,none,3600\n\
             mid,100,999.99,\n\
             defaults,none,,none\n",
        );
        let filters = load_filters(f.path(), ValueBand::at_least(50.0), 86_400).unwrap();
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0].band, ValueBand::at_least(1_000.0));
        assert_eq!(filters[0].lookback_secs, 3_600);
        assert_eq!(filters[1].band, ValueBand::between(100.0, 999.99));
        assert_eq!(filters[1].lookback_secs, 86_400);
        assert_eq!(filters[2].band, ValueBand::at_least(50.0));
    }

    #[test]
    fn malformed_batch_number_is_a_configuration_error() {
        let f = file("name,min_transfer,max_transfer,time_before_event\nx,lots,,\n");
        let err = load_filters(f.path(), ValueBand::at_least(0.0), 60).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
