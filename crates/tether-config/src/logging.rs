//! Log line formats shared by the `tether` tool and the plugins it launches.
//!
//! A plugin's stderr is relayed by the host one line at a time, so either
//! format keeps each event on a single line. The host passes its own choice
//! to plugins in [`env::LOG_FORMAT`](crate::env::LOG_FORMAT) so relayed plugin
//! lines match the host's.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Format of emitted log lines.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable single line output.
    #[default]
    Compact,
}

impl LogFormat {
    /// Format requested by a host through [`env::LOG_FORMAT`](crate::env::LOG_FORMAT).
    ///
    /// A plugin must still start when the host sends something it does not
    /// recognise, so unset or unknown values yield the default.
    ///
    /// ```
    /// use tether_config::LogFormat;
    ///
    /// assert_eq!(LogFormat::requested(Some("JSON")), LogFormat::Json);
    /// assert_eq!(LogFormat::requested(Some("pretty")), LogFormat::Compact);
    /// ```
    #[must_use]
    pub fn requested(raw: Option<&str>) -> Self {
        raw.and_then(|value| value.trim().parse().ok())
            .unwrap_or_default()
    }
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;
