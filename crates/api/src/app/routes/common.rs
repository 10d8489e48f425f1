use std::str::FromStr;

use pagewatch_core::DomainError;

use crate::app::errors;

/// Parse a path id, answering 400 when malformed.
pub fn parse_id<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: FromStr<Err = DomainError>,
{
    raw.parse::<T>().map_err(errors::domain_error_to_response)
}
