// =============================================================================
// Shared types used across the leadlens engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Current UNIX timestamp in milliseconds (UTC).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Side of a position: long or short.
///
/// One-way accounts report `positionSide=BOTH`; the normaliser resolves that
/// from the sign of the position amount and `BOTH` is never carried forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }

    /// +1.0 for long, -1.0 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Semantic action derived from a raw order-history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenLong => "OPEN_LONG",
            Self::OpenShort => "OPEN_SHORT",
            Self::CloseLong => "CLOSE_LONG",
            Self::CloseShort => "CLOSE_SHORT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "OPEN_LONG" => Self::OpenLong,
            "OPEN_SHORT" => Self::OpenShort,
            "CLOSE_LONG" => Self::CloseLong,
            "CLOSE_SHORT" => Self::CloseShort,
            _ => Self::Unknown,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort)
    }

    /// The position side this event acts on, if the action is recognised.
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::OpenLong | Self::CloseLong => Some(Side::Long),
            Self::OpenShort | Self::CloseShort => Some(Side::Short),
            Self::Unknown => None,
        }
    }

    /// The open action for `side`.
    pub fn open_for(side: Side) -> Self {
        match side {
            Side::Long => Self::OpenLong,
            Side::Short => Self::OpenShort,
        }
    }

    /// The close action for `side`.
    pub fn close_for(side: Side) -> Self {
        match side {
            Side::Long => Self::CloseLong,
            Side::Short => Self::CloseShort,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a lead trader's positions are exposed by the venue.
///
/// Derived solely from the `positionShow` flag: `true` means the venue reveals
/// open positions (VISIBLE), `false` means only the order log is exposed
/// (HIDDEN), and a missing flag is UNKNOWN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraderSegment {
    Visible,
    Hidden,
    Unknown,
}

impl TraderSegment {
    pub fn from_position_show(position_show: Option<bool>) -> Self {
        match position_show {
            Some(true) => Self::Visible,
            Some(false) => Self::Hidden,
            None => Self::Unknown,
        }
    }
}

impl std::fmt::Display for TraderSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Visible => write!(f, "VISIBLE"),
            Self::Hidden => write!(f, "HIDDEN"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Segment filter used by consensus and query operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentFilter {
    Visible,
    Hidden,
    Both,
}

impl Default for SegmentFilter {
    fn default() -> Self {
        Self::Both
    }
}

impl SegmentFilter {
    /// Whether a trader in `segment` passes this filter. UNKNOWN traders are
    /// only included by `Both`.
    pub fn matches(&self, segment: TraderSegment) -> bool {
        match self {
            Self::Visible => segment == TraderSegment::Visible,
            Self::Hidden => segment == TraderSegment::Hidden,
            Self::Both => true,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VISIBLE" => Some(Self::Visible),
            "HIDDEN" => Some(Self::Hidden),
            "BOTH" | "ALL" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visible => "VISIBLE",
            Self::Hidden => "HIDDEN",
            Self::Both => "BOTH",
        }
    }
}

impl std::fmt::Display for SegmentFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lookback window for consensus, insights, and feed queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "24h")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "7d")]
    D7,
    #[serde(rename = "30d")]
    D30,
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::D1
    }
}

impl TimeRange {
    pub fn as_millis(&self) -> i64 {
        const HOUR: i64 = 3_600_000;
        match self {
            Self::H1 => HOUR,
            Self::H4 => 4 * HOUR,
            Self::H12 => 12 * HOUR,
            Self::D1 => 24 * HOUR,
            Self::D3 => 3 * 24 * HOUR,
            Self::D7 => 7 * 24 * HOUR,
            Self::D30 => 30 * 24 * HOUR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::H12 => "12h",
            Self::D1 => "24h",
            Self::D3 => "3d",
            Self::D7 => "7d",
            Self::D30 => "30d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "12h" => Some(Self::H12),
            "24h" | "1d" => Some(Self::D1),
            "3d" => Some(Self::D3),
            "7d" => Some(Self::D7),
            "30d" => Some(Self::D30),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a position lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Active,
    Closed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Margin mode reported on a raw position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginType {
    Isolated,
    Cross,
}

impl MarginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isolated => "ISOLATED",
            Self::Cross => "CROSS",
        }
    }
}

impl std::fmt::Display for MarginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Consensus direction for a symbol after weighting all contributing traders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusDirection {
    Long,
    Short,
    Neutral,
}

impl ConsensusDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Neutral => "NEUTRAL",
        }
    }

    pub fn as_side(&self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Long),
            Self::Short => Some(Side::Short),
            Self::Neutral => None,
        }
    }
}

impl std::fmt::Display for ConsensusDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the contributing positions of a consensus entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    Visible,
    HiddenDerived,
    Mixed,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Visible => write!(f, "VISIBLE"),
            Self::HiddenDerived => write!(f, "HIDDEN_DERIVED"),
            Self::Mixed => write!(f, "MIXED"),
        }
    }
}

/// Confidence bucket attached to a trader score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreConfidence {
    Low,
    Medium,
    High,
}

impl ScoreConfidence {
    /// Multiplier applied to the base weight.
    pub fn factor(&self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 0.75,
            Self::Low => 0.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScoreConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a simulated position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimStatus {
    Open,
    Closed,
}

impl SimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a simulated position was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimSource {
    Manual,
    Auto,
}

impl SimSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Auto => "AUTO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MANUAL" => Some(Self::Manual),
            "AUTO" => Some(Self::Auto),
            _ => None,
        }
    }
}

impl std::fmt::Display for SimSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a simulated position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    Reversal,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Reversal => "REVERSAL",
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TrailingStop => "TRAILING_STOP",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
