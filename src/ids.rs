//! Sortable, type-prefixed entity identifiers.
//!
//! Every id in the system is a 128-bit ULID rendered as Crockford base32 and
//! tagged with a short prefix identifying the entity kind, e.g.
//! `job_01HZXQK7N1VXJ1R1Q2Y3Z4A5B6`. The prefix catches cross-entity mixups
//! at the type level; the ULID body keeps ids lexicographically sortable by
//! creation time, which the job/message FIFO ordering in the scheduler
//! relies on as a secondary tiebreak alongside `created_at`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Declares a newtype wrapper around a prefixed ULID string.
macro_rules! prefixed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used to render and validate this id kind.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh id, ordered after any id generated earlier.
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, Ulid::new()))
            }

            /// Parse a rendered id, checking the prefix matches.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                let (prefix, rest) = s.split_once('_').ok_or(IdError::Malformed)?;
                if prefix != $prefix {
                    return Err(IdError::WrongPrefix {
                        expected: $prefix,
                        found: prefix.to_string(),
                    });
                }
                Ulid::from_str(rest).map_err(|_| IdError::Malformed)?;
                Ok(Self(s.to_string()))
            }

            /// Borrow the full rendered id (`<prefix>_<ulid>`).
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                <String as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                let raw = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Ok(Self::parse(&raw)?)
            }
        }
    };
}

/// Error returned when a rendered id fails to parse or carries the wrong prefix.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("malformed id")]
    Malformed,
    #[error("expected id prefix {expected:?}, found {found:?}")]
    WrongPrefix { expected: &'static str, found: String },
}

prefixed_id!(OrgId, "org");
prefixed_id!(UserId, "usr");
prefixed_id!(IntegrationId, "int");
prefixed_id!(ChannelId, "chn");
prefixed_id!(JobId, "job");
prefixed_id!(ProcessedMessageId, "psm");
prefixed_id!(ActiveAgentId, "aa");
prefixed_id!(AssignmentId, "asg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_parse_roundtrip() {
        let id = JobId::generate();
        let parsed = JobId::parse(id.as_str()).expect("parses");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let job = JobId::generate();
        let err = OrgId::parse(job.as_str()).unwrap_err();
        assert!(matches!(err, IdError::WrongPrefix { .. }));
    }

    #[test]
    fn ids_sort_by_creation_order() {
        let first = JobId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = JobId::generate();
        assert!(first < second);
    }
}
