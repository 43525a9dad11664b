//! Error-handling utilities and the request-path error taxonomy.

use anyhow::Error;
use thiserror::Error as ThisError;

/// Everything that can go wrong while answering a planning request.
///
/// Providers deliberately have no variant here: a geocoding provider never
/// propagates an error past its boundary, it returns `(None, meta)` and the
/// router falls through to the next strategy. Only a fully exhausted router
/// surfaces as [`PlanError::GeocodingUnresolved`].
#[derive(Debug, ThisError)]
pub enum PlanError {
    /// Malformed request payload or out-of-range coordinate.
    #[error("{0}")]
    Validation(String),

    /// The geocoding router exhausted every strategy for a query.
    #[error("Could not geocode location: {query}.{}", format_hint(.hint))]
    GeocodingUnresolved {
        query: String,
        /// Extra operator guidance, e.g. "configure GOOGLE_MAPS_API_KEY".
        hint: Option<String>,
    },

    /// The external routing engine failed or returned a non-OK response.
    #[error("routing engine error: {0}")]
    RoutingEngine(String),

    /// The planner could not produce a feasible plan.
    #[error("{0}")]
    PlanningInfeasible(String),

    /// The station store failed; fatal for the affected request.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

fn format_hint(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!(" ({})", hint),
        None => String::new(),
    }
}

/// Display an error, plus all the underlying "causes" (ie, wrapped errors), plus a
/// backtrace.
pub(crate) fn display_causes_and_backtrace(err: &Error) {
    eprintln!("Error: {}", err);
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {}", cause);
    }
    eprintln!("{}", err.backtrace());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geocoding_unresolved_formats_hint() {
        let err = PlanError::GeocodingUnresolved {
            query: "Nowhere, XX".to_owned(),
            hint: None,
        };
        assert_eq!(err.to_string(), "Could not geocode location: Nowhere, XX.");

        let err = PlanError::GeocodingUnresolved {
            query: "Nowhere, XX".to_owned(),
            hint: Some("Google Maps API key not configured".to_owned()),
        };
        assert!(err.to_string().contains("Google Maps API key"));
    }
}
