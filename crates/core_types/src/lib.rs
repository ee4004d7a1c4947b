use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Clan tag as handed out by the upstream API, e.g. `#2PP`.
pub type TargetId = String;

const API_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.fZ";

/// Preparation lengths (seconds) a friendly war can be configured with.
const FRIENDLY_PREP_SECS: [i64; 12] = [
    5 * 60,
    15 * 60,
    30 * 60,
    60 * 60,
    2 * 60 * 60,
    4 * 60 * 60,
    6 * 60 * 60,
    8 * 60 * 60,
    12 * 60 * 60,
    16 * 60 * 60,
    20 * 60 * 60,
    24 * 60 * 60,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum WarState {
    NotInWar,
    Preparation,
    InWar,
    WarEnded,
}

impl WarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInWar => "notInWar",
            Self::Preparation => "preparation",
            Self::InWar => "inWar",
            Self::WarEnded => "warEnded",
        }
    }
}

impl fmt::Display for WarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WarType {
    Random,
    Friendly,
    Cwl,
}

impl WarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Friendly => "friendly",
            Self::Cwl => "cwl",
        }
    }
}

impl fmt::Display for WarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup key of one real-world war: sorted participant tags plus the
/// preparation start in epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WarIdentity(String);

impl WarIdentity {
    pub fn new(tag_a: &str, tag_b: &str, preparation_start: i64) -> Self {
        let (lo, hi) = sorted_pair(tag_a, tag_b);
        Self(format!("{lo}-{hi}-{preparation_start}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WarIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sorted_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub tag: TargetId,
    pub members: Vec<TargetId>,
}

/// A war that is at least in preparation. Construction goes through
/// [`WarSnapshot::decode`], which guarantees both tags are present and
/// `end >= preparation_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngagedWar {
    pub state: WarState,
    pub preparation_start: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    pub war_tag: Option<String>,
    pub clan: Participant,
    pub opponent: Participant,
}

impl EngagedWar {
    pub fn identity(&self) -> WarIdentity {
        WarIdentity::new(
            &self.clan.tag,
            &self.opponent.tag,
            self.preparation_start.timestamp(),
        )
    }

    pub fn preparation_ts(&self) -> i64 {
        self.preparation_start.timestamp()
    }

    pub fn is_ended(&self) -> bool {
        self.state == WarState::WarEnded
    }

    /// The other side of the war as seen from `tag`.
    pub fn opponent_of(&self, tag: &str) -> &str {
        if self.opponent.tag != tag {
            &self.opponent.tag
        } else {
            &self.clan.tag
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &TargetId> {
        self.clan.members.iter().chain(self.opponent.members.iter())
    }

    pub fn war_type(&self) -> Option<WarType> {
        if self.war_tag.as_deref().is_some_and(|t| !t.is_empty()) {
            return Some(WarType::Cwl);
        }
        let start = self.start?;
        let prep_secs = (start - self.preparation_start).num_seconds();
        if FRIENDLY_PREP_SECS.contains(&prep_secs) {
            Some(WarType::Friendly)
        } else {
            Some(WarType::Random)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarSnapshot {
    NotInWar,
    Engaged(EngagedWar),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("payload is not valid war json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("bad timestamp {0:?}")]
    BadTimestamp(String),
    #[error("end time precedes preparation start")]
    EndBeforePreparation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWar {
    state: WarState,
    #[serde(default)]
    preparation_start_time: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    war_tag: Option<String>,
    #[serde(default)]
    clan: Option<RawClan>,
    #[serde(default)]
    opponent: Option<RawClan>,
}

#[derive(Debug, Deserialize)]
struct RawClan {
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    members: Vec<RawMember>,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    tag: String,
}

impl WarSnapshot {
    pub fn decode(raw: &[u8]) -> Result<Self, SnapshotError> {
        let war: RawWar = serde_json::from_slice(raw)?;
        if war.state == WarState::NotInWar {
            return Ok(Self::NotInWar);
        }

        let preparation_start = parse_api_time(
            war.preparation_start_time
                .as_deref()
                .ok_or(SnapshotError::MissingField("preparationStartTime"))?,
        )?;
        let end = parse_api_time(
            war.end_time
                .as_deref()
                .ok_or(SnapshotError::MissingField("endTime"))?,
        )?;
        if end < preparation_start {
            return Err(SnapshotError::EndBeforePreparation);
        }
        let start = war.start_time.as_deref().map(parse_api_time).transpose()?;

        Ok(Self::Engaged(EngagedWar {
            state: war.state,
            preparation_start,
            start,
            end,
            war_tag: war.war_tag,
            clan: participant(war.clan, "clan.tag")?,
            opponent: participant(war.opponent, "opponent.tag")?,
        }))
    }

    pub fn state(&self) -> WarState {
        match self {
            Self::NotInWar => WarState::NotInWar,
            Self::Engaged(war) => war.state,
        }
    }
}

fn participant(raw: Option<RawClan>, field: &'static str) -> Result<Participant, SnapshotError> {
    let raw = raw.ok_or(SnapshotError::MissingField(field))?;
    let tag = raw
        .tag
        .filter(|t| !t.is_empty())
        .ok_or(SnapshotError::MissingField(field))?;
    Ok(Participant {
        tag,
        members: raw.members.into_iter().map(|m| m.tag).collect(),
    })
}

/// Parses the upstream `20240101T120000.000Z` form, falling back to RFC 3339.
pub fn parse_api_time(raw: &str) -> Result<DateTime<Utc>, SnapshotError> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, API_TIME_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SnapshotError::BadTimestamp(raw.to_string()))
}

pub fn format_api_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Deferred retrieval of one war's final result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizationJob {
    /// Tag the war was detected through; probed first.
    pub tag: TargetId,
    pub opponent_tag: TargetId,
    pub preparation_start: i64,
    pub fire_at: DateTime<Utc>,
    pub grace: Duration,
}

impl FinalizationJob {
    /// Same key whichever side the war was detected through.
    pub fn key(&self) -> String {
        let (lo, hi) = sorted_pair(&self.tag, &self.opponent_tag);
        format!("war_end_{lo}_{hi}")
    }

    pub fn identity(&self) -> WarIdentity {
        WarIdentity::new(&self.tag, &self.opponent_tag, self.preparation_start)
    }
}

/// Row created at detection time; payload arrives with finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarRecord {
    pub war_id: WarIdentity,
    pub clans: [TargetId; 2],
    pub end_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTimer {
    pub member_tag: TargetId,
    pub clans: [TargetId; 2],
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedWar {
    pub war_id: WarIdentity,
    pub clans: [TargetId; 2],
    pub end_time: i64,
    pub war_type: Option<WarType>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub index: usize,
    pub reason: String,
}

/// Outcome of an unordered bulk write: valid items are applied, the rest
/// are reported here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteReport {
    pub applied: usize,
    pub failures: Vec<WriteFailure>,
}

impl BulkWriteReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp_ms: i64,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
pub trait TargetSource: Send + Sync {
    /// Distinct targets to track for the given (1-based) cycle.
    async fn targets(&self, cycle: u64) -> Result<Vec<TargetId>>;
}

#[async_trait]
pub trait WarStore: Send + Sync {
    async fn insert_wars(&self, records: Vec<WarRecord>) -> Result<BulkWriteReport>;
    async fn upsert_member_timers(&self, timers: Vec<MemberTimer>) -> Result<BulkWriteReport>;
    async fn finalize_war(&self, war: FinalizedWar) -> Result<()>;
    /// Identities of unfinalized wars ending at or after `ending_after`.
    async fn pending_war_ids(&self, ending_after: i64) -> Result<HashSet<WarIdentity>>;
    /// Participants of non-league wars that ended at or after `ended_after`.
    async fn recent_war_participants(&self, ended_after: i64) -> Result<Vec<TargetId>>;
    async fn registered_targets(&self) -> Result<Vec<TargetId>>;
    async fn open_war_log_targets(&self) -> Result<Vec<TargetId>>;
}

/// Directory of clans seen through their profiles.
#[async_trait]
pub trait ClanDirectory: Send + Sync {
    async fn record_clan(&self, tag: &str, open_war_log: bool) -> Result<()>;
    /// A clan whose profile reports no members. It leaves the directory.
    async fn record_deleted(&self, tag: &str, profile: serde_json::Value) -> Result<()>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: BusMessage) -> Result<()>;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn war_json(state: &str, clan: &str, opponent: &str) -> String {
        serde_json::json!({
            "state": state,
            "preparationStartTime": "20240105T100000.000Z",
            "startTime": "20240106T090000.000Z",
            "endTime": "20240107T090000.000Z",
            "clan": {"tag": clan, "members": [{"tag": "#M1"}, {"tag": "#M2"}]},
            "opponent": {"tag": opponent, "members": [{"tag": "#M3"}]}
        })
        .to_string()
    }

    fn engaged(raw: &str) -> EngagedWar {
        match WarSnapshot::decode(raw.as_bytes()).expect("decode") {
            WarSnapshot::Engaged(war) => war,
            WarSnapshot::NotInWar => panic!("expected engaged war"),
        }
    }

    #[test]
    fn identity_is_symmetric_across_participants() {
        let via_a = engaged(&war_json("inWar", "#AAA", "#BBB"));
        let via_b = engaged(&war_json("inWar", "#BBB", "#AAA"));
        assert_eq!(via_a.identity(), via_b.identity());
        assert_eq!(
            via_a.identity().as_str(),
            format!("#AAA-#BBB-{}", via_a.preparation_ts())
        );
    }

    #[test]
    fn decode_parses_compact_timestamps_and_members() {
        let war = engaged(&war_json("preparation", "#AAA", "#BBB"));
        assert_eq!(war.state, WarState::Preparation);
        assert_eq!(war.preparation_start.to_rfc3339(), "2024-01-05T10:00:00+00:00");
        assert_eq!(war.members().count(), 3);
        assert_eq!(war.opponent_of("#AAA"), "#BBB");
        assert_eq!(war.opponent_of("#BBB"), "#AAA");
    }

    #[test]
    fn not_in_war_needs_no_timestamps() {
        let snap = WarSnapshot::decode(br##"{"state":"notInWar","clan":{"tag":"#A"}}"##)
            .expect("decode");
        assert_eq!(snap, WarSnapshot::NotInWar);
        assert_eq!(snap.state(), WarState::NotInWar);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(WarSnapshot::decode(b"not json").is_err());
        assert!(WarSnapshot::decode(br#"{"state":"inWar"}"#).is_err());
        assert!(WarSnapshot::decode(br#"{"state":"somethingElse"}"#).is_err());

        let backwards = serde_json::json!({
            "state": "inWar",
            "preparationStartTime": "20240107T100000.000Z",
            "endTime": "20240105T100000.000Z",
            "clan": {"tag": "#A", "members": []},
            "opponent": {"tag": "#B", "members": []}
        })
        .to_string();
        assert!(matches!(
            WarSnapshot::decode(backwards.as_bytes()),
            Err(SnapshotError::EndBeforePreparation)
        ));
    }

    #[test]
    fn war_type_classification() {
        // 23h preparation
        let random = engaged(&war_json("inWar", "#A", "#B"));
        assert_eq!(random.war_type(), Some(WarType::Random));

        let mut friendly = random.clone();
        friendly.start = Some(friendly.preparation_start + chrono::Duration::hours(1));
        assert_eq!(friendly.war_type(), Some(WarType::Friendly));

        let mut league = random.clone();
        league.war_tag = Some("#8QJ".to_string());
        assert_eq!(league.war_type(), Some(WarType::Cwl));

        let mut unknown = random;
        unknown.start = None;
        assert_eq!(unknown.war_type(), None);
    }

    #[test]
    fn job_key_ignores_detection_side() {
        let at = Utc::now();
        let a = FinalizationJob {
            tag: "#B".into(),
            opponent_tag: "#A".into(),
            preparation_start: 1,
            fire_at: at,
            grace: Duration::from_secs(1200),
        };
        let b = FinalizationJob {
            tag: "#A".into(),
            opponent_tag: "#B".into(),
            ..a.clone()
        };
        assert_eq!(a.key(), "war_end_#A_#B");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn api_time_roundtrips_through_formatter() {
        let ts = parse_api_time("20240105T100000.000Z").expect("parse");
        assert_eq!(format_api_time(ts), "20240105T100000.000Z");
        assert!(parse_api_time("2024-01-05T10:00:00Z").is_ok());
        assert!(parse_api_time("yesterday").is_err());
    }
}
