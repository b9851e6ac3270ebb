//! Log records and their rendering.

use super::LogLevel;
use crate::errors::PipelineError;
use chrono::{DateTime, Utc};
use console::Style;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Colour hint carried by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogColor {
    /// Errors.
    Red,
    /// Warnings.
    Yellow,
    /// Success.
    Green,
    /// Headings.
    Blue,
    /// Stream contents.
    Cyan,
    /// Highlights.
    Magenta,
    /// Low-priority detail.
    Dim,
}

impl LogColor {
    fn style(self) -> Style {
        match self {
            Self::Red => Style::new().red(),
            Self::Yellow => Style::new().yellow(),
            Self::Green => Style::new().green(),
            Self::Blue => Style::new().blue(),
            Self::Cyan => Style::new().cyan(),
            Self::Magenta => Style::new().magenta(),
            Self::Dim => Style::new().dim(),
        }
    }
}

/// Presentation metadata for a log entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFields {
    /// Leading symbol; defaults per level.
    pub symbol: Option<String>,
    /// Main text.
    pub message: Option<String>,
    /// Secondary text rendered after the message.
    pub info: Option<String>,
    /// Colour override.
    pub color: Option<LogColor>,
    /// Free-form key/value pairs appended to the line.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LogFields {
    /// Creates empty fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates fields carrying just a message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::new().with_message(message)
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the symbol.
    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Sets the secondary text.
    #[must_use]
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    /// Sets the colour.
    #[must_use]
    pub fn with_color(mut self, color: LogColor) -> Self {
        self.color = Some(color);
        self
    }

    /// Adds a key/value pair.
    #[must_use]
    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One leveled entry in a run's log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Presentation metadata.
    pub fields: LogFields,
    /// The error carried by error and warning entries.
    pub error: Option<PipelineError>,
    /// Spaces of indentation.
    pub indentation: usize,
    /// When the entry was added.
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(level: LogLevel, fields: LogFields, indentation: usize) -> Self {
        Self {
            level,
            fields,
            error: None,
            indentation,
            timestamp: Utc::now(),
        }
    }

    /// Attaches an error.
    #[must_use]
    pub fn with_error(mut self, error: PipelineError) -> Self {
        self.error = Some(error);
        self
    }

    fn default_symbol(&self) -> &'static str {
        match self.level {
            LogLevel::Error => "✖",
            LogLevel::Warn => "⚠",
            LogLevel::Info => "•",
            LogLevel::Debug => "·",
            LogLevel::Trace => "›",
        }
    }

    fn default_color(&self) -> Option<LogColor> {
        match self.level {
            LogLevel::Error => Some(LogColor::Red),
            LogLevel::Warn => Some(LogColor::Yellow),
            LogLevel::Info => None,
            LogLevel::Debug | LogLevel::Trace => Some(LogColor::Dim),
        }
    }

    /// Renders the record as one or more indented lines.
    ///
    /// Multi-line messages keep the indentation on every line.
    #[must_use]
    pub fn render(&self) -> String {
        let symbol = self
            .fields
            .symbol
            .as_deref()
            .unwrap_or_else(|| self.default_symbol());

        let mut message = self.fields.message.clone().unwrap_or_default();
        if let Some(ref error) = self.error {
            if message.is_empty() {
                message = error.to_string();
            } else {
                let _ = write!(message, ": {error}");
            }
        }

        let mut line = format!("{symbol} {message}");
        if let Some(ref info) = self.fields.info {
            let _ = write!(line, "  {info}");
        }
        for (key, value) in &self.fields.extra {
            match value {
                serde_json::Value::String(s) => {
                    let _ = write!(line, " {key}={s}");
                }
                other => {
                    let _ = write!(line, " {key}={other}");
                }
            }
        }

        let styled = match self.fields.color.or_else(|| self.default_color()) {
            Some(color) => color.style().apply_to(line.trim_end()).to_string(),
            None => line.trim_end().to_string(),
        };

        let indent = " ".repeat(self.indentation);
        let mut out = String::with_capacity(styled.len() + indent.len() + 1);
        for part in styled.split('\n') {
            out.push_str(&indent);
            out.push_str(part);
            out.push('\n');
        }
        out
    }
}
