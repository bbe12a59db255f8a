//! Error taxonomy with wire-stable numeric codes.
//!
//! Codes are grouped by subsystem into disjoint numeric blocks and are part
//! of the wire protocol: a reply carries the raw `i32`, and both sides must
//! render it to the same fixed text. The text table is built once at first
//! use and never mutated.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

const COMM_BASE: i32 = 0x0001_0000;
const FSBROKER_BASE: i32 = 0x0002_0000;
const NAMESPACE_BASE: i32 = 0x0003_0000;
const MASTER_BASE: i32 = 0x0004_0000;
const RANGESERVER_BASE: i32 = 0x0005_0000;
const HQL_BASE: i32 = 0x0006_0000;
const METALOG_BASE: i32 = 0x0007_0000;
const SERIALIZATION_BASE: i32 = 0x0008_0000;

/// Closed set of error codes understood by every component.
///
/// Numeric identity is stable; renumbering a variant is a wire-protocol
/// break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    ProtocolError = 1,
    RequestTruncated = 2,
    ResponseTruncated = 3,
    RequestTimeout = 4,
    LocalIoError = 5,
    BadRootLocation = 6,
    BadSchema = 7,
    InvalidMetadata = 8,
    BadKey = 9,
    MetadataNotFound = 10,
    HqlParseError = 11,
    FileNotFound = 12,
    TableDoesNotExist = 13,
    ParseError = 14,
    ConnectErrorMaster = 15,
    ConnectErrorNamespace = 16,
    TooManyColumns = 17,
    BadDomainName = 18,
    FailedExpectation = 19,
    MalformedRequest = 20,

    CommNotConnected = COMM_BASE + 1,
    CommBrokenConnection = COMM_BASE + 2,
    CommConnectError = COMM_BASE + 3,
    CommAlreadyConnected = COMM_BASE + 4,
    CommRequestTimeout = COMM_BASE + 5,
    CommSendError = COMM_BASE + 6,
    CommReceiveError = COMM_BASE + 7,
    CommPollError = COMM_BASE + 8,
    CommConflictingAddress = COMM_BASE + 9,
    CommSocketError = COMM_BASE + 10,
    CommBindError = COMM_BASE + 11,
    CommListenError = COMM_BASE + 12,

    FsBrokerBadFileHandle = FSBROKER_BASE + 1,
    FsBrokerIoError = FSBROKER_BASE + 2,
    FsBrokerFileNotFound = FSBROKER_BASE + 3,
    FsBrokerBadFilename = FSBROKER_BASE + 4,
    FsBrokerPermissionDenied = FSBROKER_BASE + 5,
    FsBrokerInvalidArgument = FSBROKER_BASE + 6,
    FsBrokerInvalidConfig = FSBROKER_BASE + 7,

    NamespaceIoError = NAMESPACE_BASE + 1,
    NamespaceCreateFailed = NAMESPACE_BASE + 2,
    NamespaceFileNotFound = NAMESPACE_BASE + 3,
    NamespaceAttrNotFound = NAMESPACE_BASE + 4,
    NamespaceDeleteError = NAMESPACE_BASE + 5,
    NamespaceBadPathname = NAMESPACE_BASE + 6,
    NamespacePermissionDenied = NAMESPACE_BASE + 7,
    NamespaceExpiredSession = NAMESPACE_BASE + 8,
    NamespaceFileExists = NAMESPACE_BASE + 9,
    NamespaceIsDirectory = NAMESPACE_BASE + 10,
    NamespaceInvalidHandle = NAMESPACE_BASE + 11,
    NamespaceRequestCancelled = NAMESPACE_BASE + 12,
    NamespaceModeRestriction = NAMESPACE_BASE + 13,
    NamespaceAlreadyLocked = NAMESPACE_BASE + 14,
    NamespaceLockConflict = NAMESPACE_BASE + 15,
    NamespaceNotLocked = NAMESPACE_BASE + 16,
    NamespaceBadAttribute = NAMESPACE_BASE + 17,
    NamespaceBerkeleydbError = NAMESPACE_BASE + 18,
    NamespaceDirNotEmpty = NAMESPACE_BASE + 19,
    NamespaceBerkeleydbDeadlock = NAMESPACE_BASE + 20,

    MasterTableExists = MASTER_BASE + 1,
    MasterBadSchema = MASTER_BASE + 2,
    MasterNotRunning = MASTER_BASE + 3,
    MasterNoRangeservers = MASTER_BASE + 4,

    RangeserverGenerationMismatch = RANGESERVER_BASE + 1,
    RangeserverRangeAlreadyLoaded = RANGESERVER_BASE + 2,
    RangeserverRangeMismatch = RANGESERVER_BASE + 3,
    RangeserverNonexistentRange = RANGESERVER_BASE + 4,
    RangeserverOutOfRange = RANGESERVER_BASE + 5,
    RangeserverRangeNotFound = RANGESERVER_BASE + 6,
    RangeserverInvalidScannerId = RANGESERVER_BASE + 7,
    RangeserverSchemaParseError = RANGESERVER_BASE + 8,
    RangeserverSchemaInvalidCfid = RANGESERVER_BASE + 9,
    RangeserverInvalidColumnfamily = RANGESERVER_BASE + 10,
    RangeserverTruncatedCommitLog = RANGESERVER_BASE + 11,
    RangeserverNoMetadataForRange = RANGESERVER_BASE + 12,
    RangeserverShuttingDown = RANGESERVER_BASE + 13,
    RangeserverCorruptCommitLog = RANGESERVER_BASE + 14,
    RangeserverUnavailable = RANGESERVER_BASE + 15,
    RangeserverTimestampOrderError = RANGESERVER_BASE + 16,
    RangeserverRowOverflow = RANGESERVER_BASE + 17,
    RangeserverTableNotFound = RANGESERVER_BASE + 18,
    RangeserverBadScanSpec = RANGESERVER_BASE + 19,

    HqlBadLoadFileFormat = HQL_BASE + 1,

    MetalogBadRangeserverHeader = METALOG_BASE + 1,
    MetalogBadMasterHeader = METALOG_BASE + 2,
    MetalogEntryTruncated = METALOG_BASE + 3,
    MetalogChecksumMismatch = METALOG_BASE + 4,
    MetalogEntryBadType = METALOG_BASE + 5,
    MetalogEntryBadOrder = METALOG_BASE + 6,

    SerializationInputOverrun = SERIALIZATION_BASE + 1,
    SerializationBadVint = SERIALIZATION_BASE + 2,
    SerializationBadVstr = SERIALIZATION_BASE + 3,
}

const ERROR_TEXT: &[(ErrorCode, &str)] = &[
    (ErrorCode::Ok, "HYPERTABLE ok"),
    (ErrorCode::ProtocolError, "HYPERTABLE protocol error"),
    (ErrorCode::RequestTruncated, "HYPERTABLE request truncated"),
    (ErrorCode::ResponseTruncated, "HYPERTABLE response truncated"),
    (ErrorCode::RequestTimeout, "HYPERTABLE request timeout"),
    (ErrorCode::LocalIoError, "HYPERTABLE local i/o error"),
    (ErrorCode::BadRootLocation, "HYPERTABLE bad root location"),
    (ErrorCode::BadSchema, "HYPERTABLE bad schema"),
    (ErrorCode::InvalidMetadata, "HYPERTABLE invalid metadata"),
    (ErrorCode::BadKey, "HYPERTABLE bad key"),
    (ErrorCode::MetadataNotFound, "HYPERTABLE metadata not found"),
    (ErrorCode::HqlParseError, "HYPERTABLE HQL parse error"),
    (ErrorCode::FileNotFound, "HYPERTABLE file not found"),
    (ErrorCode::TableDoesNotExist, "HYPERTABLE table does not exist"),
    (ErrorCode::ParseError, "HYPERTABLE parse error"),
    (ErrorCode::ConnectErrorMaster, "HYPERTABLE Master connect error"),
    (ErrorCode::ConnectErrorNamespace, "HYPERTABLE Namespace connect error"),
    (ErrorCode::TooManyColumns, "HYPERTABLE too many columns"),
    (ErrorCode::BadDomainName, "HYPERTABLE bad domain name"),
    (ErrorCode::FailedExpectation, "HYPERTABLE failed expectation"),
    (ErrorCode::MalformedRequest, "HYPERTABLE malformed request"),
    (ErrorCode::CommNotConnected, "COMM not connected"),
    (ErrorCode::CommBrokenConnection, "COMM broken connection"),
    (ErrorCode::CommConnectError, "COMM connect error"),
    (ErrorCode::CommAlreadyConnected, "COMM already connected"),
    (ErrorCode::CommRequestTimeout, "COMM request timeout"),
    (ErrorCode::CommSendError, "COMM send error"),
    (ErrorCode::CommReceiveError, "COMM receive error"),
    (ErrorCode::CommPollError, "COMM poll error"),
    (ErrorCode::CommConflictingAddress, "COMM conflicting address"),
    (ErrorCode::CommSocketError, "COMM socket error"),
    (ErrorCode::CommBindError, "COMM bind error"),
    (ErrorCode::CommListenError, "COMM listen error"),
    (ErrorCode::FsBrokerBadFileHandle, "FS BROKER bad file handle"),
    (ErrorCode::FsBrokerIoError, "FS BROKER i/o error"),
    (ErrorCode::FsBrokerFileNotFound, "FS BROKER file not found"),
    (ErrorCode::FsBrokerBadFilename, "FS BROKER bad filename"),
    (ErrorCode::FsBrokerPermissionDenied, "FS BROKER permission denied"),
    (ErrorCode::FsBrokerInvalidArgument, "FS BROKER invalid argument"),
    (ErrorCode::FsBrokerInvalidConfig, "FS BROKER invalid config value"),
    (ErrorCode::NamespaceIoError, "NAMESPACE i/o error"),
    (ErrorCode::NamespaceCreateFailed, "NAMESPACE create failed"),
    (ErrorCode::NamespaceFileNotFound, "NAMESPACE file not found"),
    (ErrorCode::NamespaceAttrNotFound, "NAMESPACE attribute not found"),
    (ErrorCode::NamespaceDeleteError, "NAMESPACE delete error"),
    (ErrorCode::NamespaceBadPathname, "NAMESPACE bad pathname"),
    (ErrorCode::NamespacePermissionDenied, "NAMESPACE permission denied"),
    (ErrorCode::NamespaceExpiredSession, "NAMESPACE expired session"),
    (ErrorCode::NamespaceFileExists, "NAMESPACE file exists"),
    (ErrorCode::NamespaceIsDirectory, "NAMESPACE is directory"),
    (ErrorCode::NamespaceInvalidHandle, "NAMESPACE invalid handle"),
    (ErrorCode::NamespaceRequestCancelled, "NAMESPACE request cancelled"),
    (ErrorCode::NamespaceModeRestriction, "NAMESPACE mode restriction"),
    (ErrorCode::NamespaceAlreadyLocked, "NAMESPACE already locked"),
    (ErrorCode::NamespaceLockConflict, "NAMESPACE lock conflict"),
    (ErrorCode::NamespaceNotLocked, "NAMESPACE not locked"),
    (ErrorCode::NamespaceBadAttribute, "NAMESPACE bad attribute"),
    (ErrorCode::NamespaceBerkeleydbError, "NAMESPACE Berkeley DB error"),
    (ErrorCode::NamespaceDirNotEmpty, "NAMESPACE directory not empty"),
    (ErrorCode::NamespaceBerkeleydbDeadlock, "NAMESPACE Berkeley DB deadlock"),
    (ErrorCode::MasterTableExists, "MASTER table exists"),
    (ErrorCode::MasterBadSchema, "MASTER bad schema"),
    (ErrorCode::MasterNotRunning, "MASTER not running"),
    (ErrorCode::MasterNoRangeservers, "MASTER no range servers"),
    (ErrorCode::RangeserverGenerationMismatch, "RANGE SERVER generation mismatch"),
    (ErrorCode::RangeserverRangeAlreadyLoaded, "RANGE SERVER range already loaded"),
    (ErrorCode::RangeserverRangeMismatch, "RANGE SERVER range mismatch"),
    (ErrorCode::RangeserverNonexistentRange, "RANGE SERVER non-existent range"),
    (ErrorCode::RangeserverOutOfRange, "RANGE SERVER out of range"),
    (ErrorCode::RangeserverRangeNotFound, "RANGE SERVER range not found"),
    (ErrorCode::RangeserverInvalidScannerId, "RANGE SERVER invalid scanner id"),
    (ErrorCode::RangeserverSchemaParseError, "RANGE SERVER schema parse error"),
    (ErrorCode::RangeserverSchemaInvalidCfid, "RANGE SERVER invalid column family id"),
    (ErrorCode::RangeserverInvalidColumnfamily, "RANGE SERVER invalid column family"),
    (ErrorCode::RangeserverTruncatedCommitLog, "RANGE SERVER truncated commit log"),
    (ErrorCode::RangeserverNoMetadataForRange, "RANGE SERVER no metadata for range"),
    (ErrorCode::RangeserverShuttingDown, "RANGE SERVER shutting down"),
    (ErrorCode::RangeserverCorruptCommitLog, "RANGE SERVER corrupt commit log"),
    (ErrorCode::RangeserverUnavailable, "RANGE SERVER unavailable"),
    (
        ErrorCode::RangeserverTimestampOrderError,
        "RANGE SERVER supplied timestamp is not strictly increasing",
    ),
    (ErrorCode::RangeserverRowOverflow, "RANGE SERVER row overflow"),
    (ErrorCode::RangeserverTableNotFound, "RANGE SERVER table not found"),
    (ErrorCode::RangeserverBadScanSpec, "RANGE SERVER bad scan specification"),
    (ErrorCode::HqlBadLoadFileFormat, "HQL bad load file format"),
    (ErrorCode::MetalogBadRangeserverHeader, "METALOG bad range server metalog header"),
    (ErrorCode::MetalogBadMasterHeader, "METALOG bad master metalog header"),
    (ErrorCode::MetalogEntryTruncated, "METALOG entry truncated"),
    (ErrorCode::MetalogChecksumMismatch, "METALOG checksum mismatch"),
    (ErrorCode::MetalogEntryBadType, "METALOG bad entry type"),
    (ErrorCode::MetalogEntryBadOrder, "METALOG entry out of order"),
    (ErrorCode::SerializationInputOverrun, "SERIALIZATION input buffer overrun"),
    (ErrorCode::SerializationBadVint, "SERIALIZATION bad vint encoding"),
    (ErrorCode::SerializationBadVstr, "SERIALIZATION bad vstr encoding"),
];

fn text_map() -> &'static HashMap<i32, &'static str> {
    static MAP: OnceLock<HashMap<i32, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut map = HashMap::with_capacity(ERROR_TEXT.len());
        for (code, text) in ERROR_TEXT {
            map.insert(*code as i32, *text);
        }
        map
    })
}

fn code_map() -> &'static HashMap<i32, ErrorCode> {
    static MAP: OnceLock<HashMap<i32, ErrorCode>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut map = HashMap::with_capacity(ERROR_TEXT.len());
        for (code, _) in ERROR_TEXT {
            map.insert(*code as i32, *code);
        }
        map
    })
}

/// Fixed human text for a raw wire code.
pub fn get_text(code: i32) -> &'static str {
    text_map().get(&code).copied().unwrap_or("ERROR NOT REGISTERED")
}

impl ErrorCode {
    /// Fixed human text for this code.
    pub fn text(self) -> &'static str {
        get_text(self as i32)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw wire code back into the taxonomy, if registered.
    pub fn from_code(code: i32) -> Option<ErrorCode> {
        code_map().get(&code).copied()
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Structured failure carrying a taxonomy code, a contextual message, and an
/// optional cause chain.
#[derive(Clone, Debug)]
pub struct Exception {
    code: ErrorCode,
    message: String,
    cause: Option<Box<Exception>>,
}

pub type Result<T> = std::result::Result<T, Exception>;

impl Exception {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap `cause` under a new outer frame.
    pub fn chain(code: ErrorCode, message: impl Into<String>, cause: Exception) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Exception> {
        self.cause.as_deref()
    }

    /// Walk the cause chain, outermost frame first.
    pub fn frames(&self) -> impl Iterator<Item = &Exception> {
        std::iter::successors(Some(self), |e| e.cause())
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exception: {} - {}", self.message, self.code.text())?;
        // A nested frame repeats the error text only when its code differs
        // from the frame above it.
        let mut prev_code = self.code;
        for frame in self.frames().skip(1) {
            write!(f, "\n\tat {}", frame.message)?;
            if frame.code != prev_code {
                write!(f, " - {}", frame.code.text())?;
                prev_code = frame.code;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Exception {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_render_fixed_text() {
        assert_eq!(ErrorCode::Ok.text(), "HYPERTABLE ok");
        assert_eq!(ErrorCode::LocalIoError.text(), "HYPERTABLE local i/o error");
        assert_eq!(ErrorCode::NamespaceFileNotFound.text(), "NAMESPACE file not found");
        assert_eq!(ErrorCode::MasterTableExists.text(), "MASTER table exists");
        assert_eq!(ErrorCode::RangeserverUnavailable.text(), "RANGE SERVER unavailable");
    }

    #[test]
    fn unknown_code_is_not_registered() {
        assert_eq!(get_text(999_999), "ERROR NOT REGISTERED");
        assert!(ErrorCode::from_code(999_999).is_none());
    }

    #[test]
    fn codes_survive_the_wire_as_raw_ints() {
        for (code, _) in ERROR_TEXT {
            let raw = code.code();
            assert_eq!(ErrorCode::from_code(raw), Some(*code));
            assert_eq!(get_text(raw), code.text());
        }
    }

    #[test]
    fn rendering_walks_the_cause_chain() {
        let inner = Exception::new(ErrorCode::LocalIoError, "y");
        let outer = Exception::chain(ErrorCode::NamespaceFileNotFound, "x", inner);
        let rendered = outer.to_string();
        let frames: Vec<&str> = rendered.split('\n').collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], "Exception: x - NAMESPACE file not found");
        // Differing inner code re-emits its text.
        assert_eq!(frames[1], "\tat y - HYPERTABLE local i/o error");
    }

    #[test]
    fn rendering_collapses_repeated_codes() {
        let inner = Exception::new(ErrorCode::LocalIoError, "read failed");
        let outer = Exception::chain(ErrorCode::LocalIoError, "scan aborted", inner);
        let rendered = outer.to_string();
        assert_eq!(
            rendered,
            "Exception: scan aborted - HYPERTABLE local i/o error\n\tat read failed"
        );
    }
}
