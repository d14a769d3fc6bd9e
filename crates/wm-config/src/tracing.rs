// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Global subscriber for encoder diagnostics.
//!
//! `RUST_LOG` selects the filter (default `info`). `WM_TRACE_CHROME=<path>`
//! additionally records a Chrome trace of encoder construction and of every
//! forward and backward pass; call [`flush_chrome_trace`] before exiting.

use std::env::VarError;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "info";
const CHROME_TRACE_VAR: &str = "WM_TRACE_CHROME";

static INSTALLED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// Subscriber settings resolved from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracingSettings {
    /// `EnvFilter` directive string.
    pub filter: String,
    /// Destination of the Chrome trace, if one was requested.
    pub chrome_trace: Option<PathBuf>,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            chrome_trace: None,
        }
    }
}

impl TracingSettings {
    pub fn from_env() -> Result<Self, InitError> {
        Self::from_vars(
            std::env::var(EnvFilter::DEFAULT_ENV).ok(),
            std::env::var(CHROME_TRACE_VAR),
        )
    }

    fn from_vars(filter: Option<String>, chrome: Result<String, VarError>) -> Result<Self, InitError> {
        let filter = filter
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let chrome_trace = match chrome {
            Ok(raw) if !raw.trim().is_empty() => Some(PathBuf::from(raw.trim())),
            Ok(_) | Err(VarError::NotPresent) => None,
            Err(err) => return Err(InitError::Env(err)),
        };
        Ok(Self {
            filter,
            chrome_trace,
        })
    }
}

/// Installs the global subscriber from [`TracingSettings::from_env`].
pub fn init_tracing() -> Result<(), InitError> {
    install(TracingSettings::from_env()?)
}

/// Installs the global subscriber. Only the first successful call in a
/// process takes effect.
pub fn install(settings: TracingSettings) -> Result<(), InitError> {
    let filter = EnvFilter::try_new(&settings.filter)?;
    INSTALLED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());
    let chrome_layer = settings.chrome_trace.map(|path| {
        let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file(path)
            .include_args(true)
            .build();
        let slot = CHROME_GUARD.get_or_init(|| Mutex::new(None));
        if let Ok(mut slot) = slot.lock() {
            *slot = Some(guard);
        }
        layer
    });

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(chrome_layer)
        .try_init()?;
    Ok(())
}

/// Flushes pending Chrome trace events. Returns `false` when no trace is
/// being recorded.
pub fn flush_chrome_trace() -> bool {
    let Some(slot) = CHROME_GUARD.get() else {
        return false;
    };
    match slot.lock() {
        Ok(guard) => match guard.as_ref() {
            Some(guard) => {
                guard.flush();
                true
            }
            None => false,
        },
        Err(_) => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read WM_TRACE_CHROME: {0}")]
    Env(VarError),
    #[error("invalid tracing filter: {0}")]
    Filter(#[from] ParseError),
    #[error("another global subscriber is installed: {0}")]
    Install(#[from] TryInitError),
}
