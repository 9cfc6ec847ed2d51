use serde::Deserialize;
use serde::Serialize;

/// What a deep-research trace entry represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStepKind {
    Reasoning,
    WebSearch,
    Synthesis,
    /// Unrecognized kinds degrade to a generic analysis entry.
    #[default]
    #[serde(other)]
    Analysis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStepStatus {
    Completed,
    Error,
    #[default]
    #[serde(other)]
    Active,
}

/// One unit of a multi-step research trace. Steps are identified by `id`;
/// repeated arrivals with the same id update the existing entry in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchStep {
    pub id: String,
    #[serde(default)]
    pub kind: ResearchStepKind,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub status: ResearchStepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// Set when `content` carries an incremental reasoning fragment rather
    /// than a full replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_delta: Option<bool>,
    /// Full accumulated reasoning text; supersedes `content` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
}

impl ResearchStep {
    /// Merge a later arrival of the same step into this one. Later fields
    /// win when they carry a value; absent fields leave the existing value
    /// untouched. Incremental reasoning fragments (`is_delta`) append to
    /// `content` instead of replacing it, and `full_content` replaces the
    /// accumulation wholesale.
    pub fn merge_from(&mut self, other: ResearchStep) {
        let ResearchStep {
            id: _,
            kind,
            title,
            content,
            source_url,
            sources_count,
            recent_sources,
            timestamp,
            status,
            query,
            focus,
            sequence_number,
            is_delta,
            full_content,
        } = other;

        self.kind = kind;
        if !title.is_empty() {
            self.title = title;
        }
        if let Some(full) = full_content {
            self.content = Some(full.clone());
            self.full_content = Some(full);
        } else if let Some(content) = content {
            if is_delta.unwrap_or(false) {
                match &mut self.content {
                    Some(existing) => existing.push_str(&content),
                    None => self.content = Some(content),
                }
            } else {
                self.content = Some(content);
            }
        }
        if source_url.is_some() {
            self.source_url = source_url;
        }
        if sources_count.is_some() {
            self.sources_count = sources_count;
        }
        if !recent_sources.is_empty() {
            self.recent_sources = recent_sources;
        }
        if timestamp.is_some() {
            self.timestamp = timestamp;
        }
        self.status = status;
        if query.is_some() {
            self.query = query;
        }
        if focus.is_some() {
            self.focus = focus;
        }
        if sequence_number.is_some() {
            self.sequence_number = sequence_number;
        }
        if is_delta.is_some() {
            self.is_delta = is_delta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn step(id: &str) -> ResearchStep {
        ResearchStep {
            id: id.to_string(),
            kind: ResearchStepKind::WebSearch,
            title: "Searching".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn later_fields_overwrite_earlier_ones() {
        let mut first = step("s1");
        first.query = Some("rust sse".to_string());

        let mut second = step("s1");
        second.status = ResearchStepStatus::Completed;
        second.sources_count = Some(7);
        second.title = "Searched the web".to_string();

        first.merge_from(second);
        assert_eq!(first.title, "Searched the web");
        assert_eq!(first.status, ResearchStepStatus::Completed);
        assert_eq!(first.sources_count, Some(7));
        // Absent in the later arrival, so the earlier value survives.
        assert_eq!(first.query.as_deref(), Some("rust sse"));
    }

    #[test]
    fn delta_content_appends() {
        let mut first = step("s1");
        first.content = Some("thinking".to_string());

        let mut delta = step("s1");
        delta.content = Some(" harder".to_string());
        delta.is_delta = Some(true);

        first.merge_from(delta);
        assert_eq!(first.content.as_deref(), Some("thinking harder"));
    }

    #[test]
    fn full_content_supersedes_accumulation() {
        let mut first = step("s1");
        first.content = Some("partial".to_string());

        let mut fin = step("s1");
        fin.full_content = Some("the whole trace".to_string());

        first.merge_from(fin);
        assert_eq!(first.content.as_deref(), Some("the whole trace"));
    }

    #[test]
    fn unknown_kind_and_status_fall_back() {
        let parsed: ResearchStep = serde_json::from_str(
            r#"{"id":"s9","kind":"quantum_meditation","status":"paused"}"#,
        )
        .expect("tolerant parse");
        assert_eq!(parsed.kind, ResearchStepKind::Analysis);
        assert_eq!(parsed.status, ResearchStepStatus::Active);
    }
}
