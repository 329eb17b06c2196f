//! Newick reading and writing.
//!
//! The reader produces a plain parent/child arena that the summary-tree
//! store and the conflict engine specialize. Labels may embed OTT ids
//! (`ott93302` as a whole label, or a `name ott93302` / `name_ott93302`
//! suffix) and phylesystem source-node names (`nodeYYY`); both are
//! recognized here so the stores don't re-parse strings.

use memchr::{memchr2, memchr3};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::taxonomy::OttId;
use crate::{Error, Result};

#[derive(Clone, Debug, Default)]
pub struct ParsedNode {
    pub name: String,
    pub ott_id: Option<OttId>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// A freshly parsed rooted tree; node 0 is the root.
#[derive(Clone, Debug)]
pub struct ParsedTree {
    pub nodes: Vec<ParsedNode>,
}

impl ParsedTree {
    pub const ROOT: usize = 0;

    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.children.is_empty()).count()
    }
}

static WHOLE_OTT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ott(\d+)$").unwrap());
static SUFFIX_OTT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_ ]ott(\d+)$").unwrap());
static SOURCE_NODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[_ ])(node\d+)$").unwrap());

/// The OTT id embedded in a label, if any. `mrcaott…ott…` labels carry no
/// id of their own and map to `None`.
pub fn ott_id_from_label(label: &str) -> Option<OttId> {
    if let Some(c) = WHOLE_OTT_ID.captures(label) {
        return c[1].parse().ok();
    }
    if let Some(c) = SUFFIX_OTT_ID.captures(label) {
        return c[1].parse().ok();
    }
    None
}

/// The phylesystem source-node name (`nodeYYY`) hiding in a label like
/// `Homo_sapiens_node42_ott770315`, or the label as-is.
pub fn source_node_name(label: &str) -> &str {
    let trimmed = match SUFFIX_OTT_ID.find(label) {
        Some(m) => &label[..m.start()],
        None => label,
    };
    match SOURCE_NODE.captures(trimmed) {
        Some(c) => {
            let m = c.get(1).unwrap();
            &trimmed[m.start()..m.end()]
        }
        None => trimmed,
    }
}

/// Parse a newick string into a [`ParsedTree`].
///
/// Quoted labels ('...' with doubled embedded quotes) and branch lengths
/// are handled; lengths are discarded since every tree here is a cladogram.
pub fn parse_newick(input: &str) -> Result<ParsedTree> {
    let buf = input.trim().as_bytes();
    if buf.is_empty() {
        return Err(Error::bad_request("empty newick string"));
    }
    let mut nodes = vec![ParsedNode::default()];
    let mut lineage: Vec<usize> = vec![ParsedTree::ROOT];
    let mut cur = ParsedTree::ROOT;
    let mut pos = 0;
    let mut seen_semicolon = false;
    while pos < buf.len() {
        match buf[pos] {
            b'(' => {
                let child = nodes.len();
                nodes.push(ParsedNode {
                    parent: Some(cur),
                    ..Default::default()
                });
                nodes[cur].children.push(child);
                lineage.push(child);
                cur = child;
                pos += 1;
            }
            b',' => {
                lineage.pop();
                let parent = *lineage
                    .last()
                    .ok_or_else(|| Error::bad_request("unbalanced ',' in newick"))?;
                let child = nodes.len();
                nodes.push(ParsedNode {
                    parent: Some(parent),
                    ..Default::default()
                });
                nodes[parent].children.push(child);
                lineage.push(child);
                cur = child;
                pos += 1;
            }
            b')' => {
                lineage.pop();
                cur = *lineage
                    .last()
                    .ok_or_else(|| Error::bad_request("unbalanced ')' in newick"))?;
                pos += 1;
            }
            b';' => {
                seen_semicolon = true;
                pos += 1;
            }
            b':' => {
                // skip the branch length
                let end = memchr3(b',', b')', b';', &buf[pos..])
                    .map(|x| x + pos)
                    .unwrap_or(buf.len());
                pos = end;
            }
            b'\'' => {
                let (label, next) = read_quoted_label(input, pos)?;
                set_label(&mut nodes[cur], label);
                pos = next;
            }
            c if c.is_ascii_whitespace() => {
                pos += 1;
            }
            _ => {
                let end = memchr3(b',', b')', b':', &buf[pos..])
                    .map(|x| x + pos)
                    .unwrap_or_else(|| {
                        memchr2(b';', b'(', &buf[pos..])
                            .map(|x| x + pos)
                            .unwrap_or(buf.len())
                    });
                // a bare label may still be followed by ';'
                let chunk = input[pos..end].trim_end_matches(';').trim();
                set_label(&mut nodes[cur], chunk.to_string());
                pos = end;
            }
        }
    }
    if !seen_semicolon && !lineage.is_empty() && lineage.len() != 1 {
        return Err(Error::bad_request("newick string ended inside a clade"));
    }
    Ok(ParsedTree { nodes })
}

fn set_label(node: &mut ParsedNode, label: String) {
    node.ott_id = ott_id_from_label(&label);
    node.name = label;
}

fn read_quoted_label(input: &str, start: usize) -> Result<(String, usize)> {
    debug_assert_eq!(input.as_bytes()[start], b'\'');
    let bytes = input.as_bytes();
    let mut label = String::new();
    let mut pos = start + 1;
    while pos < bytes.len() {
        if bytes[pos] == b'\'' {
            if pos + 1 < bytes.len() && bytes[pos + 1] == b'\'' {
                label.push('\'');
                pos += 2;
            } else {
                return Ok((label, pos + 1));
            }
        } else {
            // labels are utf-8; push whole chars, not bytes
            let c = input[pos..].chars().next().unwrap();
            label.push(c);
            pos += c.len_utf8();
        }
    }
    Err(Error::bad_request("unterminated quoted label in newick"))
}

/// Quote a label when it contains structural characters, per the usual
/// newick rule: wrap in single quotes, double any embedded quote.
pub fn escape_newick(label: &str) -> String {
    let needs_quoting = label
        .chars()
        .any(|c| matches!(c, '(' | ')' | ',' | ':' | ';' | '\'' | '[' | ']') || c.is_whitespace());
    if !needs_quoting {
        return label.to_string();
    }
    let mut out = String::with_capacity(label.len() + 2);
    out.push('\'');
    for c in label.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Write a subtree as newick, driven by closures so taxonomy and summary
/// arenas can share it. `namer` returns the (unescaped) label, or an empty
/// string to leave a node unlabeled; `height_limit < 0` means unbounded,
/// and a node at the limit is emitted as a tip.
pub fn write_newick<N, CF, NF>(root: N, children: &CF, namer: &mut NF, height_limit: i64) -> String
where
    N: Copy,
    CF: Fn(N) -> Vec<N>,
    NF: FnMut(N) -> String,
{
    let mut out = String::new();
    write_newick_inner(&mut out, root, children, namer, height_limit);
    out.push(';');
    out
}

fn write_newick_inner<N, CF, NF>(
    out: &mut String,
    node: N,
    children: &CF,
    namer: &mut NF,
    height_limit: i64,
) where
    N: Copy,
    CF: Fn(N) -> Vec<N>,
    NF: FnMut(N) -> String,
{
    let kids = children(node);
    if !kids.is_empty() && height_limit != 0 {
        out.push('(');
        for (i, c) in kids.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_newick_inner(out, c, children, namer, height_limit - 1);
        }
        out.push(')');
    }
    let label = namer(node);
    if !label.is_empty() {
        out.push_str(&escape_newick(&label));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_label_id_extraction() {
        assert_eq!(ott_id_from_label("ott770315"), Some(770_315));
        assert_eq!(ott_id_from_label("Homo sapiens ott770315"), Some(770_315));
        assert_eq!(ott_id_from_label("Homo_sapiens_ott770315"), Some(770_315));
        assert_eq!(ott_id_from_label("mrcaott770315ott417950"), None);
        assert_eq!(ott_id_from_label("Homo sapiens"), None);
        // an id too wide for the pinned width is not an id
        assert_eq!(ott_id_from_label("ott99999999999999999999"), None);
    }

    #[test]
    fn test_source_node_name() {
        assert_eq!(source_node_name("node42"), "node42");
        assert_eq!(source_node_name("Homo_sapiens_node42_ott770315"), "node42");
        assert_eq!(source_node_name("Homo sapiens ott770315"), "Homo sapiens");
        assert_eq!(source_node_name("mrcaott1ott2"), "mrcaott1ott2");
    }

    #[test]
    fn test_parse_basic() -> Result<()> {
        let t = parse_newick("((A_ott3,B_ott4)AB,(C_ott5,D_ott6)CD)root;")?;
        assert_eq!(t.num_leaves(), 4);
        assert_eq!(t.nodes[ParsedTree::ROOT].name, "root");
        let ab = t.nodes[ParsedTree::ROOT].children[0];
        assert_eq!(t.nodes[ab].name, "AB");
        let a = t.nodes[ab].children[0];
        assert_eq!(t.nodes[a].name, "A_ott3");
        assert_eq!(t.nodes[a].ott_id, Some(3));
        Ok(())
    }

    #[test]
    fn test_parse_quoted_and_lengths() -> Result<()> {
        let t = parse_newick("('Homo sapiens ott770315':0.1,'don''t':2)x;")?;
        assert_eq!(t.num_leaves(), 2);
        let a = t.nodes[0].children[0];
        let b = t.nodes[0].children[1];
        assert_eq!(t.nodes[a].name, "Homo sapiens ott770315");
        assert_eq!(t.nodes[a].ott_id, Some(770_315));
        assert_eq!(t.nodes[b].name, "don't");
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_newick("").is_err());
        assert!(parse_newick("((A,B;").is_err());
        assert!(parse_newick("('unterminated,B);").is_err());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_newick("Homo"), "Homo");
        assert_eq!(escape_newick("Homo sapiens"), "'Homo sapiens'");
        assert_eq!(escape_newick("weird(name)"), "'weird(name)'");
        assert_eq!(escape_newick("don't"), "'don''t'");
    }

    #[test]
    fn test_write_round_trip() -> Result<()> {
        let t = parse_newick("((A,B)E,(C,D)F)R;")?;
        let children = |n: usize| t.nodes[n].children.clone();
        let mut namer = |n: usize| t.nodes[n].name.clone();
        let s = write_newick(ParsedTree::ROOT, &children, &mut namer, -1);
        assert_eq!(s, "((A,B)E,(C,D)F)R;");
        Ok(())
    }

    #[test]
    fn test_write_height_limit() -> Result<()> {
        let t = parse_newick("((A,B)E,(C,D)F)R;")?;
        let children = |n: usize| t.nodes[n].children.clone();
        let mut namer = |n: usize| t.nodes[n].name.clone();
        let s = write_newick(ParsedTree::ROOT, &children, &mut namer, 1);
        assert_eq!(s, "(E,F)R;");
        Ok(())
    }
}
