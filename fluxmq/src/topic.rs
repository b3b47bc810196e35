use std::fmt::{self, Write};
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

pub use crate::error::TopicError;

#[inline]
fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS, only ever the first level
    Blank,
    SingleWildcard, // Single level wildcard +
    MultiWildcard,  // Multi-level wildcard #
}

impl Level {
    pub fn normal<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        if s.as_ref().contains(['+', '#']) {
            return Err(TopicError::InvalidLevel(format!(
                "invalid normal level `{}` contains +|#",
                s.as_ref()
            )));
        }
        Ok(Level::Normal(String::from(s.as_ref())))
    }

    pub fn metadata<T: AsRef<str>>(s: T) -> Result<Level, TopicError> {
        if s.as_ref().contains(['+', '#']) || !is_metadata(s.as_ref()) {
            return Err(TopicError::InvalidLevel(format!("invalid metadata level `{}`", s.as_ref())));
        }
        Ok(Level::Metadata(String::from(s.as_ref())))
    }

    /// Parses one level; `root` marks the first level of a topic, the only place `$` is special.
    fn parse(s: &str, root: bool) -> Result<Level, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ if s.contains(['+', '#']) => {
                Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
            }
            _ if root && is_metadata(s) => Ok(Level::Metadata(String::from(s))),
            _ => Ok(Level::Normal(String::from(s))),
        }
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }

    /// Whether this literal level equals the published segment.
    #[inline]
    fn accepts(&self, segment: &str) -> bool {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => s == segment,
            Level::Blank => segment.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => true,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    /// Parses a subscription filter: wildcards allowed, `#` only as the last level.
    pub fn parse_filter(s: &str) -> Result<Topic, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic filter".into()));
        }
        let levels = s
            .split('/')
            .enumerate()
            .map(|(idx, l)| Level::parse(l, idx == 0))
            .collect::<Result<Vec<_>, TopicError>>()?;
        let topic = Topic(levels);
        if topic.is_valid() {
            Ok(topic)
        } else {
            Err(TopicError::InvalidTopic(format!("invalid topic filter `{}`", s)))
        }
    }

    /// Parses a topic name as carried by PUBLISH: no wildcards.
    pub fn parse_name(s: &str) -> Result<Topic, TopicError> {
        if s.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic name".into()));
        }
        let topic = Self::parse_filter(s)?;
        if topic.0.iter().any(|l| l.is_wildcard()) {
            return Err(TopicError::InvalidTopic(format!("topic name `{}` contains wildcards", s)));
        }
        Ok(topic)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        let last = self.0.len().saturating_sub(1);
        self.0.iter().enumerate().all(|(pos, level)| match *level {
            Level::MultiWildcard => pos == last,
            Level::Metadata(_) => pos == 0,
            Level::Normal(ref s) => !s.contains(['+', '#']),
            _ => true,
        })
    }

    #[inline]
    pub fn has_wildcards(&self) -> bool {
        self.0.iter().any(|l| l.is_wildcard())
    }

    /// Filter-to-filter match: whether every topic `other` can match is also matched by `self`.
    pub fn matches(&self, other: &Topic) -> bool {
        let mut lhs = self.0.iter();
        for (idx, rhs) in other.0.iter().enumerate() {
            match lhs.next() {
                Some(Level::MultiWildcard) => return !(idx == 0 && rhs.is_metadata()),
                Some(Level::SingleWildcard) => {
                    if *rhs == Level::MultiWildcard || (idx == 0 && rhs.is_metadata()) {
                        return false;
                    }
                }
                Some(level) if level == rhs => continue,
                _ => return false,
            }
        }
        Self::tail_matches(lhs)
    }

    /// Filter-to-name match following the MQTT wildcard rules, including the
    /// exclusion of `$` topics from root level wildcards.
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        let mut lhs = self.0.iter();
        for (idx, segment) in topic.as_ref().split('/').enumerate() {
            let root_metadata = idx == 0 && is_metadata(segment);
            match lhs.next() {
                Some(Level::MultiWildcard) => return !root_metadata,
                Some(Level::SingleWildcard) if root_metadata => return false,
                Some(level) if level.accepts(segment) => continue,
                _ => return false,
            }
        }
        Self::tail_matches(lhs)
    }

    // a trailing "#" also matches the parent level
    #[inline]
    fn tail_matches<'a>(mut rest: impl Iterator<Item = &'a Level>) -> bool {
        match rest.next() {
            None => true,
            Some(Level::MultiWildcard) => rest.next().is_none(),
            Some(_) => false,
        }
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        Topic::parse_filter(s)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }

            level.fmt(f)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level() {
        assert!(Level::metadata("$SYS").unwrap().is_metadata());
        assert_eq!(Level::normal("sport").unwrap().value(), Some("sport"));
        assert!(Level::normal("sport#").is_err());
        assert!(Level::metadata("SYS").is_err());
    }

    #[test]
    fn test_parse() {
        assert!(Topic::parse_filter("sport/tennis/+").is_ok());
        assert!(Topic::parse_filter("#").is_ok());
        assert!(Topic::parse_filter("sport/#").is_ok());
        assert!(Topic::parse_filter("/finance").is_ok());
        assert!(Topic::parse_filter("a/$b/c").is_ok());
        assert!(Topic::parse_filter("").is_err());
        assert!(Topic::parse_filter("sport/#/ranking").is_err());
        assert!(Topic::parse_filter("sport+").is_err());
        assert!(Topic::parse_filter("sport/tennis#").is_err());

        assert!(Topic::parse_name("sport/tennis").is_ok());
        assert!(Topic::parse_name("$SYS/broker").is_ok());
        assert!(Topic::parse_name("sport/+").is_err());
        assert!(Topic::parse_name("#").is_err());
        assert!(Topic::parse_name("").is_err());

        let t = Topic::parse_filter("$SYS/a/+").unwrap();
        assert_eq!(t.levels()[0], Level::Metadata("$SYS".into()));
        assert_eq!(t.to_string(), "$SYS/a/+");
        let t = Topic::parse_filter("a/$b").unwrap();
        assert_eq!(t.levels()[1], Level::Normal("$b".into()));
    }

    #[test]
    fn test_matches_str() {
        let f = |s: &str| Topic::parse_filter(s).unwrap();

        assert!(f("sport/+/player1").matches_str("sport/tennis/player1"));
        assert!(!f("sport/+/player1").matches_str("sport/tennis/player1/ranking"));
        assert!(f("sport/tennis/player1/#").matches_str("sport/tennis/player1"));
        assert!(f("sport/tennis/player1/#").matches_str("sport/tennis/player1/ranking"));
        assert!(f("sport/#").matches_str("sport"));
        assert!(f("#").matches_str("sport/tennis"));
        assert!(f("+/+").matches_str("/finance"));
        assert!(f("/+").matches_str("/finance"));
        assert!(!f("+").matches_str("/finance"));
        assert!(!f("sport/+").matches_str("sport"));
        assert!(f("sport/+").matches_str("sport/"));

        assert!(!f("#").matches_str("$SYS/broker"));
        assert!(!f("+/broker").matches_str("$SYS/broker"));
        assert!(f("$SYS/#").matches_str("$SYS/broker"));
        assert!(f("$SYS/+").matches_str("$SYS/broker"));
        assert!(f("a/+").matches_str("a/$b"));
    }

    #[test]
    fn test_matches_filter() {
        let f = |s: &str| Topic::parse_filter(s).unwrap();

        assert!(f("sport/#").matches(&f("sport/tennis/+")));
        assert!(f("sport/+").matches(&f("sport/+")));
        assert!(!f("sport/+").matches(&f("sport/#")));
        assert!(f("#").matches(&f("a/b")));
        assert!(!f("#").matches(&f("$SYS/b")));
        assert!(!f("a/b").matches(&f("a/+")));
        assert!(f("a/#").matches(&f("a")));
    }
}
