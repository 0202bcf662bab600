use std::fmt::{Display, Formatter};

use crate::{AppError, AppResult};

/// Identity of one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn from_str(tp_str: &str) -> AppResult<Self> {
        let (topic, partition) = Self::parse_topic_partition(tp_str).ok_or_else(|| {
            AppError::InvalidValue(format!("invalid topic partition name: {}", tp_str))
        })?;
        Ok(Self { topic, partition })
    }

    fn parse_topic_partition(tp_str: &str) -> Option<(String, i32)> {
        let last_hyphen_idx = tp_str.rfind('-')?;
        let (topic, partition_str) = tp_str.split_at(last_hyphen_idx);
        let partition = partition_str[1..].parse::<i32>().ok()?;
        Some((topic.to_string(), partition))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}
