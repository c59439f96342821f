pub mod captcha;
pub mod fetch;
pub mod session;
pub mod tunnel;

use crate::{AppError, Result};

/// Splits a `Name: value` header argument.
pub(crate) fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| AppError::InvalidArgument(format!("header without ':': {raw}")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidArgument(format!("empty header name: {raw}")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub(crate) fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter().map(|header| parse_header(header)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_values_keep_inner_colons() {
        let (name, value) = parse_header("Referer: https://example.com/a").unwrap();
        assert_eq!(name, "Referer");
        assert_eq!(value, "https://example.com/a");
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header(": value").is_err());
    }
}
