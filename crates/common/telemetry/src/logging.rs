// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Global `tracing` subscriber setup.
//!
//! Transfer lanes, the retrying executor and the storage client only emit
//! `tracing` events; whoever embeds the engine decides where they go by
//! calling one of the `init_*` functions here once at startup.

use std::{
    env,
    io::IsTerminal,
    sync::{Arc, Mutex, Once},
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing::Subscriber;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, fmt::MakeWriter, layer::SubscriberExt,
    registry::LookupSpan,
};

/// Deserializes a string, falling back to `T::default()` when it is empty.
///
/// # Errors
/// Returns an error if the non-empty string is not a valid `T`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// Default directory for log files when file logging is enabled.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "objsync";

/// Handle for changing the log filter at runtime.
///
/// Only set after `init_global_logging` has run.
pub static RELOAD_HANDLE: OnceCell<tracing_subscriber::reload::Handle<filter::Targets, Registry>> =
    OnceCell::new();

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for hourly-rotated log files. Empty disables file logging.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Filter directives such as `"info,objsync_transfer=debug"`. Falls back to
    /// `RUST_LOG`, then to `info`.
    pub level: Option<String>,

    /// Output format for every layer.
    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// How many rotated files to keep (per file layer).
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Also write to stdout.
    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Log line format.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span attached.
    Json,

    /// Human-readable lines.
    #[default]
    Text,
}

/// Stdout-only text logging with default options.
///
/// Keep the returned guards alive for as long as logs should be flushed.
#[must_use]
pub fn init_tracing_subscriber(app_name: &str) -> Vec<WorkerGuard> {
    init_global_logging(app_name, &LoggingOptions::default())
}

/// Logging for tests: files under `UNITTEST_LOG_DIR` (default
/// `/tmp/__unittest_logs`), filter from `UNITTEST_LOG_LEVEL`.
///
/// Safe to call from every test; only the first call installs the subscriber.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let mut g = GLOBAL_UT_LOG_GUARD.as_ref().lock().unwrap();

        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());

        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| {
            "debug,hyper=warn,hyper_util=warn,tower=warn,reqwest=warn,h2=info".to_string()
        });
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };
        *g = Some(init_global_logging("unittest", &opts));

        tracing::info!("logs dir = {}", dir);
    });
}

static GLOBAL_UT_LOG_GUARD: Lazy<Arc<Mutex<Option<Vec<WorkerGuard>>>>> =
    Lazy::new(|| Arc::new(Mutex::new(None)));

const DEFAULT_LOG_TARGETS: &str = "info";

/// Installs the global subscriber: optional stdout layer, optional rolling
/// file layer plus an error-only rolling file layer, behind a reloadable
/// target filter.
///
/// Runs at most once per process; later calls return no guards.
///
/// # Panics
///
/// Panics if the log directory cannot be used, the filter string does not
/// parse, or another global subscriber is already installed.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        LogTracer::init().expect("log tracer must be valid");

        let stdout_logging_layer = if opts.append_stdout {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            Some(fmt_layer(
                writer,
                opts.log_format,
                std::io::stdout().is_terminal(),
            ))
        } else {
            None
        };

        let file_logging_layer = if opts.dir.is_empty() {
            None
        } else {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(opts, LOG_FILE_PREFIX));
            guards.push(guard);
            Some(fmt_layer(writer, opts.log_format, false))
        };

        let err_file_logging_layer = if opts.dir.is_empty() {
            None
        } else {
            let prefix = format!("{LOG_FILE_PREFIX}-err");
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(opts, &prefix));
            guards.push(guard);
            Some(
                fmt_layer(writer, opts.log_format, false)
                    .with_filter(filter::LevelFilter::ERROR)
                    .boxed(),
            )
        };

        let filter = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .expect("error parsing log level string");

        let (dyn_filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);

        RELOAD_HANDLE
            .set(reload_handle)
            .expect("reload handle already set, maybe init_global_logging get called twice?");

        let subscriber = Registry::default()
            .with(dyn_filter)
            .with(stdout_logging_layer)
            .with(file_logging_layer)
            .with(err_file_logging_layer);

        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");

        tracing::debug!(app = app_name, dir = %opts.dir, "logging initialized");
    });

    guards
}

fn rolling_appender(opts: &LoggingOptions, prefix: &str) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .unwrap_or_else(|e| {
            panic!(
                "initializing rolling file appender at {} failed: {}",
                &opts.dir, e
            )
        })
}

fn fmt_layer<S, W>(writer: W, format: LogFormat, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = LoggingOptions::default();
        assert!(opts.dir.is_empty());
        assert!(opts.level.is_none());
        assert_eq!(opts.log_format, LogFormat::Text);
        assert_eq!(opts.max_log_files, 720);
        assert!(opts.append_stdout);
    }

    #[test]
    fn test_empty_format_string_uses_default() {
        let opts: LoggingOptions =
            serde_json::from_str(r#"{"log_format": "", "dir": "/var/log/objsync"}"#).unwrap();
        assert_eq!(opts.log_format, LogFormat::Text);
        assert_eq!(opts.dir, "/var/log/objsync");
        assert!(opts.append_stdout);
    }

    #[test]
    fn test_json_format_parses() {
        let opts: LoggingOptions = serde_json::from_str(r#"{"log_format": "json"}"#).unwrap();
        assert_eq!(opts.log_format, LogFormat::Json);
    }

    #[test]
    fn test_builder() {
        let opts = LoggingOptions::builder()
            .dir(DEFAULT_LOGGING_DIR.to_string())
            .level("debug".to_string())
            .append_stdout(false)
            .build();
        assert_eq!(opts.dir, "logs");
        assert_eq!(opts.level.as_deref(), Some("debug"));
        assert!(!opts.append_stdout);
        assert_eq!(opts.max_log_files, 720);
    }
}
