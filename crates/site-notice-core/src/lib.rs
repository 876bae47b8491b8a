use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Fixed namespace prefix for dismissal markers. Keeps the key space
/// collision-free against unrelated features sharing the same backing
/// storage.
pub const DISMISSAL_KEY_PREFIX: &str = "siteNoticeKey-";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NoticeError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Author-chosen stable identity key for a message. Historical dismissals
/// are keyed by id, so an id MUST never be reused for different content.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Displayable payload, opaque to selection. Markup is rendered by the
/// surrounding view; this subsystem never inspects it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Markup(String),
}

/// Ambient application state readable by show conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppContext {
    pub app_name: String,
    pub hostname: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl AppContext {
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Pure predicate over ambient context, carried as a function value rather
/// than a subtype. Evaluated fresh on every selection call, never cached.
#[derive(Clone)]
pub struct ShowCondition(Arc<dyn Fn(&AppContext) -> bool + Send + Sync>);

impl ShowCondition {
    pub fn new(predicate: impl Fn(&AppContext) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    #[must_use]
    pub fn evaluate(&self, context: &AppContext) -> bool {
        (self.0)(context)
    }
}

impl std::fmt::Debug for ShowCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShowCondition(..)")
    }
}

/// One immutable catalog entry.
///
/// `show_condition` is skipped during (de)serialization: catalogs loaded
/// from JSON cannot carry code, only in-process catalogs attach predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub content: MessageContent,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub date_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub date_end: OffsetDateTime,
    #[serde(skip)]
    pub show_condition: Option<ShowCondition>,
}

// Function values have no equality; messages compare by their data fields.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.content == other.content
            && self.date_start == other.date_start
            && self.date_end == other.date_end
    }
}

impl Message {
    /// Validate one catalog entry.
    ///
    /// # Errors
    /// Returns [`NoticeError::Validation`] when the id is empty or the
    /// display window is inverted.
    pub fn validate(&self) -> Result<(), NoticeError> {
        if self.id.as_str().trim().is_empty() {
            return Err(NoticeError::Validation("message id MUST be non-empty".to_string()));
        }

        if let Some(date_start) = self.date_start {
            if date_start > self.date_end {
                return Err(NoticeError::Validation(format!(
                    "message {}: date_start MUST be <= date_end",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

/// Ordered sequence of candidate messages. Order is priority order: the
/// first eligible entry wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Catalog {
    pub messages: Vec<Message>,
}

impl Catalog {
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Validate every entry and the uniqueness of ids across the catalog.
    ///
    /// # Errors
    /// Returns [`NoticeError::Validation`] for the first invalid entry or
    /// the first duplicated id.
    pub fn validate(&self) -> Result<(), NoticeError> {
        let mut seen = BTreeSet::new();
        for message in &self.messages {
            message.validate()?;
            if !seen.insert(message.id.clone()) {
                return Err(NoticeError::Validation(format!(
                    "message id {} MUST be unique within the catalog",
                    message.id
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Derive the namespaced dismissal-marker key for a message id.
#[must_use]
pub fn dismissal_key(message_id: &MessageId) -> String {
    format!("{DISMISSAL_KEY_PREFIX}{message_id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DismissalScope {
    Durable,
    Session,
}

impl DismissalScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Session => "session",
        }
    }
}

/// Uniform key→presence interface over one backing store. The two dismissal
/// scopes are two instances of this interface differing only in backing
/// lifetime.
pub trait MarkerStore {
    /// Presence check for a marker key.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the backend cannot be read;
    /// callers on the read path treat that as absence.
    fn contains(&self, key: &str) -> Result<bool, NoticeError>;

    /// Write a presence marker. Writing an existing key MUST be a no-op.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the backend rejects the write.
    fn put(&mut self, key: &str) -> Result<(), NoticeError>;
}

/// In-process marker store: the ephemeral instance inside a single
/// evaluation process, and the test double.
#[derive(Debug, Clone, Default)]
pub struct MemoryMarkerStore {
    markers: BTreeSet<String>,
}

impl MemoryMarkerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn contains(&self, key: &str) -> Result<bool, NoticeError> {
        Ok(self.markers.contains(key))
    }

    fn put(&mut self, key: &str) -> Result<(), NoticeError> {
        self.markers.insert(key.to_string());
        Ok(())
    }
}

/// Record-keeping facade over the two dismissal scopes. Append-only from
/// the selector's perspective: markers are never removed here.
#[derive(Debug)]
pub struct DismissalLedger<D, S> {
    durable: D,
    session: S,
}

impl<D, S> DismissalLedger<D, S>
where
    D: MarkerStore,
    S: MarkerStore,
{
    #[must_use]
    pub fn new(durable: D, session: S) -> Self {
        Self { durable, session }
    }

    /// True iff a marker exists for the id in the given scope. Fail-open:
    /// a backend read failure degrades to "no record found", never an
    /// error, since over-showing a dismissible notice is safer than
    /// permanently hiding it.
    #[must_use]
    pub fn has_been_acted_on(&self, scope: DismissalScope, message_id: &MessageId) -> bool {
        let key = dismissal_key(message_id);
        let present = match scope {
            DismissalScope::Durable => self.durable.contains(&key),
            DismissalScope::Session => self.session.contains(&key),
        };
        present.unwrap_or(false)
    }

    /// True iff either scope suppresses the id.
    #[must_use]
    pub fn is_suppressed(&self, message_id: &MessageId) -> bool {
        self.has_been_acted_on(DismissalScope::Durable, message_id)
            || self.has_been_acted_on(DismissalScope::Session, message_id)
    }

    /// Write the permanent dismissal marker. Idempotent.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the durable backend rejects
    /// the write; evaluation itself never fails on this.
    pub fn record_dismissal(&mut self, message_id: &MessageId) -> Result<(), NoticeError> {
        self.durable.put(&dismissal_key(message_id))
    }

    /// Write the session-scoped remind-later marker. Idempotent.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the session backend rejects
    /// the write.
    pub fn record_remind_later(&mut self, message_id: &MessageId) -> Result<(), NoticeError> {
        self.session.put(&dismissal_key(message_id))
    }
}

/// Per-tick selection input, supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    #[serde(with = "time::serde::rfc3339")]
    pub now: OffsetDateTime,
    pub context: AppContext,
    /// Display gate: true when running under an automated-testing agent,
    /// in which case nothing is ever shown.
    pub automated_agent: bool,
}

impl Evaluation {
    #[must_use]
    pub fn new(now: OffsetDateTime, context: AppContext) -> Self {
        Self { now, context, automated_agent: false }
    }
}

fn is_eligible<D, S>(message: &Message, eval: &Evaluation, ledger: &DismissalLedger<D, S>) -> bool
where
    D: MarkerStore,
    S: MarkerStore,
{
    if ledger.is_suppressed(&message.id) {
        return false;
    }

    // Expiry is an exclusive upper bound: now must be strictly before it.
    if eval.now >= message.date_end {
        return false;
    }

    if let Some(date_start) = message.date_start {
        if eval.now < date_start {
            return false;
        }
    }

    match &message.show_condition {
        Some(condition) => condition.evaluate(&eval.context),
        None => true,
    }
}

/// Compute the single message (if any) currently eligible for display.
///
/// Scans the catalog in order and returns the first entry that is not
/// suppressed in either scope, is inside its display window, and whose
/// show condition (if any) holds against the current context. Returns
/// `None` when the catalog has not been produced yet or when the
/// evaluation runs under an automated agent. Re-evaluation starts from the
/// top of the catalog on every call, so dismissing the leading message
/// lets the next eligible one surface on the following tick.
#[must_use]
pub fn select_current<'a, D, S>(
    catalog: Option<&'a Catalog>,
    eval: &Evaluation,
    ledger: &DismissalLedger<D, S>,
) -> Option<&'a Message>
where
    D: MarkerStore,
    S: MarkerStore,
{
    if eval.automated_agent {
        return None;
    }

    let catalog = catalog?;
    catalog.messages.iter().find(|message| is_eligible(message, eval, ledger))
}

/// Per-message lifecycle position, derived at any instant from the clock
/// and the ledger; never stored. "Shown" is a render-time condition (the
/// currently selected message), not a derivable state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Dismissed,
    RemindedThisSession,
    Expired,
}

impl MessageState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dismissed => "dismissed",
            Self::RemindedThisSession => "reminded_this_session",
            Self::Expired => "expired",
        }
    }
}

/// Derive the state of one message. Expiry is terminal and independent of
/// ledger contents, so it takes precedence over both marker scopes.
#[must_use]
pub fn message_state<D, S>(
    message: &Message,
    now: OffsetDateTime,
    ledger: &DismissalLedger<D, S>,
) -> MessageState
where
    D: MarkerStore,
    S: MarkerStore,
{
    if now >= message.date_end {
        return MessageState::Expired;
    }
    if ledger.has_been_acted_on(DismissalScope::Durable, &message.id) {
        return MessageState::Dismissed;
    }
    if ledger.has_been_acted_on(DismissalScope::Session, &message.id) {
        return MessageState::RemindedThisSession;
    }
    MessageState::Pending
}

/// Render-facing evaluation state: the catalog snapshot, the ledger, and
/// the single observable "already acted this session" flag, reset only on
/// full reload (a fresh board).
#[derive(Debug)]
pub struct NoticeBoard<D, S> {
    catalog: Option<Catalog>,
    ledger: DismissalLedger<D, S>,
    dismissed: bool,
}

impl<D, S> NoticeBoard<D, S>
where
    D: MarkerStore,
    S: MarkerStore,
{
    /// A board with no catalog yet; selection returns `None` until the
    /// source resolves and [`Self::install_catalog`] is called.
    #[must_use]
    pub fn new(ledger: DismissalLedger<D, S>) -> Self {
        Self { catalog: None, ledger, dismissed: false }
    }

    /// Install the resolved catalog snapshot. Called once per process,
    /// after the source completes; the snapshot is immutable afterwards.
    ///
    /// # Errors
    /// Returns [`NoticeError::Validation`] when the catalog is invalid.
    pub fn install_catalog(&mut self, catalog: Catalog) -> Result<(), NoticeError> {
        catalog.validate()?;
        self.catalog = Some(catalog);
        Ok(())
    }

    #[must_use]
    pub fn has_catalog(&self) -> bool {
        self.catalog.is_some()
    }

    #[must_use]
    pub fn dismissed(&self) -> bool {
        self.dismissed
    }

    #[must_use]
    pub fn ledger(&self) -> &DismissalLedger<D, S> {
        &self.ledger
    }

    /// The message the view should render right now, or `None`.
    #[must_use]
    pub fn current(&self, eval: &Evaluation) -> Option<&Message> {
        if self.dismissed {
            return None;
        }
        select_current(self.catalog.as_ref(), eval, &self.ledger)
    }

    /// Permanently dismiss a message. The in-memory flag is set before the
    /// marker write, so a failed persist still suppresses re-display for
    /// the rest of this process; the error is surfaced so the view may
    /// warn that the dismissal might not stick.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the durable write fails.
    pub fn dismiss(&mut self, message_id: &MessageId) -> Result<(), NoticeError> {
        self.dismissed = true;
        self.ledger.record_dismissal(message_id)
    }

    /// Suppress a message for the remainder of the session only.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the session write fails.
    pub fn remind_later(&mut self, message_id: &MessageId) -> Result<(), NoticeError> {
        self.dismissed = true;
        self.ledger.record_remind_later(message_id)
    }

    /// Dismiss whatever is currently shown, returning its id.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the durable write fails.
    pub fn dismiss_current(&mut self, eval: &Evaluation) -> Result<Option<MessageId>, NoticeError> {
        let Some(message_id) = self.current(eval).map(|message| message.id.clone()) else {
            return Ok(None);
        };
        self.dismiss(&message_id)?;
        Ok(Some(message_id))
    }

    /// Remind-later whatever is currently shown, returning its id.
    ///
    /// # Errors
    /// Returns [`NoticeError::Storage`] when the session write fails.
    pub fn remind_later_current(
        &mut self,
        eval: &Evaluation,
    ) -> Result<Option<MessageId>, NoticeError> {
        let Some(message_id) = self.current(eval).map(|message| message.id.clone()) else {
            return Ok(None);
        };
        self.remind_later(&message_id)?;
        Ok(Some(message_id))
    }
}
