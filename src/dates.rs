use chrono::NaiveDate;

/// How a `YYMMDD`-convention date was written, so it can be written back the
/// same way.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum DateStyle {
    #[default]
    TwoDigitYear,
    FourDigitYear,
}

/// Parse a run date written as `YYMMDD` or `YYYYMMDD`, trying the short form
/// first. Returns `None` when neither form is a valid calendar date.
pub fn parse_run_date(token: &str) -> Option<(NaiveDate, DateStyle)> {
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match token.len() {
        6 => NaiveDate::parse_from_str(token, "%y%m%d")
            .ok()
            .map(|d| (d, DateStyle::TwoDigitYear)),
        8 => NaiveDate::parse_from_str(token, "%Y%m%d")
            .ok()
            .map(|d| (d, DateStyle::FourDigitYear)),
        _ => None,
    }
}

pub fn format_run_date(date: NaiveDate, style: DateStyle) -> String {
    match style {
        DateStyle::TwoDigitYear => date.format("%y%m%d").to_string(),
        DateStyle::FourDigitYear => date.format("%Y%m%d").to_string(),
    }
}

/// Parse a date column from an externally produced manifest. Accepts the run
/// date forms plus ISO `YYYY-MM-DD` and `YYYY/MM/DD`.
pub fn parse_manifest_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Some((date, _)) = parse_run_date(value) {
        return Some(date);
    }
    let normalized = value.replace('/', "-");
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").ok()
}
