/// Job identifiers are random UUIDs rendered in hyphenated form.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
