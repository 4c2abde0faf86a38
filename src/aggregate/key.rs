use anyhow::{bail, Context, Result};
use std::fmt;
use std::str::FromStr;

/// Addresses one unit of derived statistics: a listener's year or the global year.
///
/// Written as `user:<id>:<year>` or `global:<year>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateKey {
    User { user_id: String, year: i32 },
    Global { year: i32 },
}

impl AggregateKey {
    pub fn user(user_id: impl Into<String>, year: i32) -> Self {
        AggregateKey::User {
            user_id: user_id.into(),
            year,
        }
    }

    pub fn global(year: i32) -> Self {
        AggregateKey::Global { year }
    }

    pub fn year(&self) -> i32 {
        match self {
            AggregateKey::User { year, .. } | AggregateKey::Global { year } => *year,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            AggregateKey::User { user_id, .. } => Some(user_id),
            AggregateKey::Global { .. } => None,
        }
    }

    pub fn scope(&self) -> &'static str {
        match self {
            AggregateKey::User { .. } => "user",
            AggregateKey::Global { .. } => "global",
        }
    }

    /// Column values used by the SQLite stores: `(scope, user_id, year)`,
    /// with an empty user id for the global key.
    pub fn to_columns(&self) -> (&'static str, &str, i32) {
        (self.scope(), self.user_id().unwrap_or(""), self.year())
    }

    pub fn from_columns(scope: &str, user_id: &str, year: i32) -> Result<Self> {
        match scope {
            "user" if !user_id.is_empty() => Ok(AggregateKey::user(user_id, year)),
            "user" => bail!("user key without user id"),
            "global" => Ok(AggregateKey::global(year)),
            other => bail!("unknown aggregate scope {:?}", other),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateKey::User { user_id, year } => write!(f, "user:{}:{}", user_id, year),
            AggregateKey::Global { year } => write!(f, "global:{}", year),
        }
    }
}

impl FromStr for AggregateKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(year) = s.strip_prefix("global:") {
            let year = year.parse().with_context(|| format!("bad year in {:?}", s))?;
            return Ok(AggregateKey::global(year));
        }
        if let Some(rest) = s.strip_prefix("user:") {
            // user ids may contain ':' (e.g. DIDs), the year is always last
            let (user_id, year) = rest
                .rsplit_once(':')
                .with_context(|| format!("missing year in {:?}", s))?;
            let year = year.parse().with_context(|| format!("bad year in {:?}", s))?;
            return AggregateKey::from_columns("user", user_id, year);
        }
        bail!("expected user:<id>:<year> or global:<year>, got {:?}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let key = AggregateKey::user("did:plc:abc", 2025);
        assert_eq!(key.to_string(), "user:did:plc:abc:2025");
        assert_eq!(key.to_string().parse::<AggregateKey>().unwrap(), key);

        let global = AggregateKey::global(2024);
        assert_eq!(global.to_string().parse::<AggregateKey>().unwrap(), global);
    }

    #[test]
    fn parse_errors() {
        assert!("user:2025".parse::<AggregateKey>().is_err());
        assert!("global:soon".parse::<AggregateKey>().is_err());
        assert!("team:x:2025".parse::<AggregateKey>().is_err());
    }

    #[test]
    fn columns() {
        let key = AggregateKey::global(2025);
        assert_eq!(key.to_columns(), ("global", "", 2025));
        assert_eq!(AggregateKey::from_columns("global", "", 2025).unwrap(), key);
        assert!(AggregateKey::from_columns("user", "", 2025).is_err());
    }
}
