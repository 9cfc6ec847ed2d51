//! Citation marker rendering.
//!
//! An answer carries three marker families: numeric `[n]`, image `[d_n]`,
//! and knowledge-base `K[d_n]`. Rendering resolves markers into links over
//! the session's citation lists. A still-streaming answer has no
//! server-provided index map yet, so resolution falls back to first-seen
//! canonicalization and the answer stays renderable incrementally.

use std::collections::HashMap;
use std::sync::OnceLock;

use quill_protocol::Citation;
use quill_protocol::ImageCitation;
use regex_lite::Regex;

const MARKER_PATTERN: &str = r"(K?)\[(\d+)(?:_(\d+))?\]";

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(MARKER_PATTERN).unwrap_or_else(|err| panic!("marker pattern: {err}"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Marker {
    Numeric(u32),
    Image(u32, u32),
    Knowledge(u32),
}

/// Resolve citation markers in `text` into links.
///
/// Numeric and knowledge-base markers resolve through `index_map` when the
/// server provided one; indices missing from a partial map are assigned
/// greedily in first-seen order. A marker whose resolution lands outside
/// `citations` renders as the empty string, never a dangling link. Duplicate
/// image markers keep their first occurrence only, and whitespace between
/// adjacent markers is collapsed.
pub fn render_answer(
    text: &str,
    citations: &[Citation],
    image_citations: &[ImageCitation],
    index_map: Option<&HashMap<u32, usize>>,
) -> String {
    let mut out = String::new();
    let mut last_end = 0;
    let mut prev_end: Option<usize> = None;

    // First-seen canonicalization for indices the server map does not cover.
    let mut fallback: HashMap<u32, usize> = HashMap::new();
    // First-seen assignment and dedup for image markers.
    let mut image_assign: HashMap<(u32, u32), usize> = HashMap::new();

    for caps in marker_regex().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let gap = &text[last_end..whole.start()];
        // Collapse whitespace-only gaps between consecutive markers.
        let gap_is_marker_run = prev_end.is_some() && !gap.is_empty() && gap.trim().is_empty();
        if !gap_is_marker_run {
            out.push_str(gap);
        }

        let marker = parse_marker(&caps);
        match marker {
            Some(Marker::Numeric(n)) | Some(Marker::Knowledge(n)) => {
                if let Some(idx) = resolve_index(n, index_map, &mut fallback)
                    && let Some(citation) = citations.get(idx)
                {
                    render_link(&mut out, idx + 1, &citation.url);
                }
            }
            Some(Marker::Image(d, n)) => {
                let first_occurrence = !image_assign.contains_key(&(d, n));
                if first_occurrence {
                    let idx = image_assign.len();
                    image_assign.insert((d, n), idx);
                    if let Some(image) = image_citations.get(idx) {
                        render_image(&mut out, idx + 1, &image.image_url);
                    }
                }
            }
            None => out.push_str(whole.as_str()),
        }

        prev_end = Some(whole.end());
        last_end = whole.end();
    }
    out.push_str(&text[last_end..]);
    out
}

fn parse_marker(caps: &regex_lite::Captures<'_>) -> Option<Marker> {
    let knowledge = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
    let first: u32 = caps.get(2)?.as_str().parse().ok()?;
    let second: Option<u32> = match caps.get(3) {
        Some(m) => Some(m.as_str().parse().ok()?),
        None => None,
    };
    Some(match (knowledge, second) {
        (true, _) => Marker::Knowledge(first),
        (false, Some(n)) => Marker::Image(first, n),
        (false, None) => Marker::Numeric(first),
    })
}

fn resolve_index(
    n: u32,
    index_map: Option<&HashMap<u32, usize>>,
    fallback: &mut HashMap<u32, usize>,
) -> Option<usize> {
    if let Some(map) = index_map
        && let Some(idx) = map.get(&n)
    {
        return Some(*idx);
    }
    let next = fallback.len();
    Some(*fallback.entry(n).or_insert(next))
}

fn render_link(out: &mut String, label: usize, url: &str) {
    out.push('[');
    out.push_str(&label.to_string());
    out.push_str("](");
    out.push_str(url);
    out.push(')');
}

fn render_image(out: &mut String, label: usize, url: &str) {
    out.push_str("![");
    out.push_str(&label.to_string());
    out.push_str("](");
    out.push_str(url);
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn citation(url: &str) -> Citation {
        Citation::with_url(url)
    }

    fn image(url: &str) -> ImageCitation {
        ImageCitation {
            image_url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn numeric_marker_resolves_through_the_server_map() {
        let citations = vec![citation("https://x")];
        let map = HashMap::from([(3, 0)]);
        let rendered = render_answer("see [3].", &citations, &[], Some(&map));
        assert_eq!(rendered, "see [1](https://x).");
    }

    #[test]
    fn unresolvable_marker_renders_as_empty() {
        let rendered = render_answer("see [3].", &[], &[], None);
        assert_eq!(rendered, "see .");

        // Present in the map but pointing outside the list: same rule.
        let map = HashMap::from([(3, 9)]);
        let rendered = render_answer("see [3].", &[citation("https://x")], &[], Some(&map));
        assert_eq!(rendered, "see .");
    }

    #[test]
    fn missing_map_assigns_first_seen_order() {
        let citations = vec![citation("https://a"), citation("https://b")];
        let rendered = render_answer("[7] then [2] then [7]", &citations, &[], None);
        assert_eq!(
            rendered,
            "[1](https://a) then [2](https://b) then [1](https://a)"
        );
    }

    #[test]
    fn partial_map_falls_back_per_index() {
        let citations = vec![citation("https://mapped"), citation("https://fallback")];
        // Only index 5 is covered by the server map; 9 falls back but the
        // fallback assignment starts over from the head of the list.
        let map = maplit::hashmap! { 5 => 0 };
        let rendered = render_answer("[5] and [9]", &citations, &[], Some(&map));
        assert_eq!(rendered, "[1](https://mapped) and [1](https://mapped)");
    }

    #[test]
    fn duplicate_image_markers_render_once() {
        let images = vec![image("https://img/1")];
        let rendered = render_answer("look [0_1] ... [0_1]", &[], &images, None);
        assert_eq!(rendered, "look ![1](https://img/1) ... ");
    }

    #[test]
    fn knowledge_markers_resolve_like_numeric_ones() {
        let citations = vec![citation("https://kb")];
        let map = HashMap::from([(2, 0)]);
        let rendered = render_answer("per K[2_0].", &citations, &[], Some(&map));
        assert_eq!(rendered, "per [1](https://kb).");
    }

    #[test]
    fn whitespace_runs_between_markers_collapse() {
        let citations = vec![citation("https://a"), citation("https://b")];
        let rendered = render_answer("facts [1] [2] end", &citations, &[], None);
        assert_eq!(rendered, "facts [1](https://a)[2](https://b) end");
    }

    #[test]
    fn text_without_markers_is_untouched_even_mid_stream() {
        let rendered = render_answer("plain prose, no markers", &[], &[], None);
        assert_eq!(rendered, "plain prose, no markers");
    }
}
