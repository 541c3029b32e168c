use crate::error::AppError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, error};

/// Parses `Name: value` strings into a header map.
///
/// Splits at the first ':' and trims both sides. Repeating a name keeps the last value.
pub fn parse_headers(headers: &[String]) -> Result<HeaderMap, AppError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let Some((name, value)) = header.split_once(':') else {
            error!("Invalid header format: {header}");
            return Err(AppError::InvalidInput(format!(
                "invalid header `{header}`, expected `Name: value`"
            )));
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
            AppError::InvalidInput(format!("invalid header name in `{header}`: {e}"))
        })?;
        let value = HeaderValue::from_str(value.trim()).map_err(|e| {
            AppError::InvalidInput(format!("invalid header value in `{header}`: {e}"))
        })?;
        debug!("Added header: {name}");
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_name_value_pairs() {
        let headers = parse_headers(&[
            "Referer: https://example.com/".to_string(),
            "Cookie:session=abc; theme=dark".to_string(),
        ])
        .unwrap();
        assert_eq!(headers["referer"], "https://example.com/");
        assert_eq!(headers["cookie"], "session=abc; theme=dark");
    }

    #[test]
    fn value_may_contain_colons() {
        let headers = parse_headers(&["Origin: https://example.com:8443".to_string()]).unwrap();
        assert_eq!(headers["origin"], "https://example.com:8443");
    }

    #[test]
    fn last_value_wins() {
        let headers =
            parse_headers(&["X-Token: a".to_string(), "x-token: b".to_string()]).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-token"], "b");
    }

    #[rstest]
    #[case("no separator")]
    #[case("Bad Name: value")]
    #[case(": empty name")]
    #[case("X-Bad: line\nbreak")]
    fn rejects_malformed_headers(#[case] input: &str) {
        assert!(matches!(
            parse_headers(&[input.to_string()]),
            Err(AppError::InvalidInput(_))
        ));
    }
}
