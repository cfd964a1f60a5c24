//! Action registry: the closed catalog of signal codes.
//!
//! Every frame carries one signal alongside its payload. Codes are grouped
//! into contiguous, non-overlapping ranges by [`Category`]; the dispatch code
//! in the client and server only ever asks for the category or matches on the
//! decoded [`Signal`], never on raw integers.

use std::fmt;
use std::ops::Range;

/// Codes reserved for free-form (custom) command requests.
pub const CUSTOM_RANGE: Range<u32> = 1_048_576..2_097_152;
/// Codes reserved for stock commands. New stock commands go here.
pub const STOCK_RANGE: Range<u32> = 2_097_152..9_437_184;
/// Codes reserved for error and status signals.
pub const STATUS_RANGE: Range<u32> = 9_437_184..10_485_760;
/// Codes reserved for signals sent by clients.
pub const CLIENT_RANGE: Range<u32> = 10_485_760..11_534_336;
/// Codes reserved for signals sent by the server.
pub const SERVER_RANGE: Range<u32> = 11_534_336..12_582_912;

/// A decoded signal.
///
/// The discriminant is the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Signal {
    /// Run the payload items as free-form commands.
    Custom = 1_153_433,

    Whoami = 2_097_152,
    Hostname = 2_202_009,
    Pwd = 2_306_867,
    Ls = 2_411_724,
    Ipconfig = 2_516_582,

    /// Anything that did not decode. Never produced on purpose.
    Invalid = 9_437_184,
    /// Nothing to do this round.
    NoResponseNeeded = 9_542_041,
    /// The requested file does not exist on the client.
    FileNotFound = 9_646_899,

    ClientHello = 10_485_760,
    ClientResponse = 10_590_617,
    ClientFail = 10_695_475,
    ClientKill = 10_800_332,
    ClientFileSend = 10_905_190,

    ServerSeesHello = 11_534_336,
    ServerSeesResponse = 11_639_193,
    ServerFileSend = 11_744_051,
    ServerFileRecv = 11_848_908,
}

/// Range-based classification of a signal code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Custom,
    Stock,
    Status,
    Client,
    Server,
}

impl Category {
    /// Classify a raw code, or `None` if it falls outside every range.
    pub fn of(code: u32) -> Option<Self> {
        if CUSTOM_RANGE.contains(&code) {
            Some(Self::Custom)
        } else if STOCK_RANGE.contains(&code) {
            Some(Self::Stock)
        } else if STATUS_RANGE.contains(&code) {
            Some(Self::Status)
        } else if CLIENT_RANGE.contains(&code) {
            Some(Self::Client)
        } else if SERVER_RANGE.contains(&code) {
            Some(Self::Server)
        } else {
            None
        }
    }
}

impl Signal {
    /// Every live signal, in code order.
    pub const ALL: [Signal; 18] = [
        Signal::Custom,
        Signal::Whoami,
        Signal::Hostname,
        Signal::Pwd,
        Signal::Ls,
        Signal::Ipconfig,
        Signal::Invalid,
        Signal::NoResponseNeeded,
        Signal::FileNotFound,
        Signal::ClientHello,
        Signal::ClientResponse,
        Signal::ClientFail,
        Signal::ClientKill,
        Signal::ClientFileSend,
        Signal::ServerSeesHello,
        Signal::ServerSeesResponse,
        Signal::ServerFileSend,
        Signal::ServerFileRecv,
    ];

    /// Decode a wire code. Unknown codes become [`Signal::Invalid`].
    pub fn decode(code: u32) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.code() == code)
            .unwrap_or(Signal::Invalid)
    }

    /// The wire code for this signal.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// The category range this signal belongs to.
    pub fn category(self) -> Category {
        // Every variant sits inside a range; the tests pin that down.
        Category::of(self.code()).unwrap_or(Category::Status)
    }

    /// Whether this signal names a stock command.
    pub fn is_stock(self) -> bool {
        is_stock_command(self.code())
    }

    /// All stock commands, in code order.
    pub fn stock_commands() -> impl Iterator<Item = Signal> {
        Self::ALL.into_iter().filter(|s| s.is_stock())
    }

    /// Upper-case name as shown to operators (`"LS"`, `"CLIENT_HELLO"`).
    pub const fn name(self) -> &'static str {
        match self {
            Signal::Custom => "CUSTOM",
            Signal::Whoami => "WHOAMI",
            Signal::Hostname => "HOSTNAME",
            Signal::Pwd => "PWD",
            Signal::Ls => "LS",
            Signal::Ipconfig => "IPCONFIG",
            Signal::Invalid => "NOT_A_VALID_INTEGER",
            Signal::NoResponseNeeded => "NO_RESPONSE_NEEDED",
            Signal::FileNotFound => "FILE_NOT_FOUND",
            Signal::ClientHello => "CLIENT_HELLO",
            Signal::ClientResponse => "CLIENT_RESPONSE",
            Signal::ClientFail => "CLIENT_FAIL",
            Signal::ClientKill => "CLIENT_KILL",
            Signal::ClientFileSend => "CLIENT_FILE_SEND",
            Signal::ServerSeesHello => "SERVER_SEES_HELLO",
            Signal::ServerSeesResponse => "SERVER_SEES_RESPONSE",
            Signal::ServerFileSend => "SERVER_FILE_SEND",
            Signal::ServerFileRecv => "SERVER_FILE_RECV",
        }
    }

    /// Look up a signal by name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

impl Default for Signal {
    /// The "nothing to do" signal a reset connection falls back to.
    fn default() -> Self {
        Signal::NoResponseNeeded
    }
}

impl From<u32> for Signal {
    fn from(code: u32) -> Self {
        Signal::decode(code)
    }
}

impl From<Signal> for u32 {
    fn from(signal: Signal) -> Self {
        signal.code()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `code` falls inside the stock-command range.
pub fn is_stock_command(code: u32) -> bool {
    STOCK_RANGE.contains(&code)
}
