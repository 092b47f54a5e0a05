//! Error classification for the logging engine.
//!
//! Errors propagate as `anyhow::Error` chains; an [`ErrorMetadata`] attached
//! via `.context(...)` tags a chain with one of the engine's error kinds so
//! callers can classify without string matching. The scheduler uses this to
//! tell the one fatal kind ([`ErrorCode::SinkUnavailable`]) apart from the
//! per-device failures it recovers from locally.

use std::borrow::Cow;

/// Tag object for an `anyhow` chain. The `msg` is the developer-facing
/// description; `short_msg` is a stable ScreamingCamelCase label usable in
/// tests and diagnostics rows.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short CapitalCamelCase label, resilient to changes in copy.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed INI, missing required field, bad number, unknown type.
    ConfigInvalid,
    /// Network/connect failure; recovered by marking the connection
    /// disconnected and retrying on the next due tick.
    DeviceUnreachable,
    /// Per-request read I/O failure.
    DeviceReadError,
    /// Per-request write I/O failure.
    DeviceWriteError,
    /// Per-tag encoding mismatch; the row proceeds with NULL for the tag.
    DecodeError,
    /// The sink rejected an insert even after retry. Fatal: stops the logger.
    SinkUnavailable,
    /// Bad response surfaced to IPC callers.
    ProtocolError,
    /// Missing or unreadable TLS material at server construction.
    AuthMaterialInvalid,
    /// Programmer-facing: duplicate names, invalid addresses.
    BadArgument,
    /// `start()` refused because the sink cannot be opened.
    LoggerNotReady,
}

macro_rules! metadata_ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(
            short_msg: impl Into<Cow<'static, str>>,
            msg: impl Into<Cow<'static, str>>,
        ) -> Self {
            Self {
                code: ErrorCode::$code,
                short_msg: short_msg.into(),
                msg: msg.into(),
            }
        }
    };
}

impl ErrorMetadata {
    metadata_ctor!(config_invalid, ConfigInvalid);

    metadata_ctor!(device_unreachable, DeviceUnreachable);

    metadata_ctor!(device_read_error, DeviceReadError);

    metadata_ctor!(device_write_error, DeviceWriteError);

    metadata_ctor!(decode_error, DecodeError);

    metadata_ctor!(sink_unavailable, SinkUnavailable);

    metadata_ctor!(protocol_error, ProtocolError);

    metadata_ctor!(auth_material_invalid, AuthMaterialInvalid);

    metadata_ctor!(bad_argument, BadArgument);

    metadata_ctor!(logger_not_ready, LoggerNotReady);
}

/// Classification queries on an `anyhow::Error` chain. An untagged chain
/// answers `false` to every query.
pub trait ErrorMetadataAnyhowExt {
    fn error_code(&self) -> Option<ErrorCode>;
    fn is_sink_unavailable(&self) -> bool;
    fn is_config_invalid(&self) -> bool;
    fn is_bad_argument(&self) -> bool;
    fn short_msg(&self) -> &str;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_code(&self) -> Option<ErrorCode> {
        self.downcast_ref::<ErrorMetadata>().map(|e| e.code)
    }

    fn is_sink_unavailable(&self) -> bool {
        self.error_code() == Some(ErrorCode::SinkUnavailable)
    }

    fn is_config_invalid(&self) -> bool {
        self.error_code() == Some(ErrorCode::ConfigInvalid)
    }

    fn is_bad_argument(&self) -> bool {
        self.error_code() == Some(ErrorCode::BadArgument)
    }

    fn short_msg(&self) -> &str {
        self.downcast_ref::<ErrorMetadata>()
            .map(|e| &*e.short_msg)
            .unwrap_or("InternalError")
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_classification_through_context_layers() {
        let e: anyhow::Error = anyhow::anyhow!("disk full")
            .context(ErrorMetadata::sink_unavailable(
                "InsertFailed",
                "could not insert diagnostics row",
            ))
            .context("while logging");
        assert!(e.is_sink_unavailable());
        assert_eq!(e.short_msg(), "InsertFailed");
        assert_eq!(e.error_code(), Some(ErrorCode::SinkUnavailable));
    }

    #[test]
    fn test_untagged_chain() {
        let e = anyhow::anyhow!("plain");
        assert!(!e.is_sink_unavailable());
        assert_eq!(e.error_code(), None);
        assert_eq!(e.short_msg(), "InternalError");
    }
}
