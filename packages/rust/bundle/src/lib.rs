//! Bundle assembly: ordered fragments + item metadata → one output document.
//!
//! The pool only depends on the [`Assembler`] trait. [`MarkdownAssembler`]
//! is the built-in implementation; it converts each fragment's HTML with
//! `htmd`, runs the cleanup passes, and stitches the result under a YAML
//! frontmatter block. [`write_bundle`] persists the bytes atomically.

mod cleanup;
mod writer;

use chrono::Utc;
use tracing::{debug, instrument};

use folio_shared::{FolioError, Fragment, Result};

pub use writer::{bundle_file_name, write_bundle};

/// Item-level metadata handed to the assembler alongside the fragments.
#[derive(Debug, Clone)]
pub struct BundleMeta {
    pub id: String,
    pub title: String,
    pub source_url: String,
    /// Fragments that were replaced by a placeholder.
    pub failed_fragments: usize,
}

/// Turns an ordered, fully populated fragment list into bundle bytes.
pub trait Assembler: Send + Sync {
    fn assemble(&self, meta: &BundleMeta, fragments: &[Fragment]) -> Result<Vec<u8>>;

    /// File extension for bundles produced by this assembler.
    fn extension(&self) -> &str;
}

// ---------------------------------------------------------------------------
// MarkdownAssembler
// ---------------------------------------------------------------------------

/// Assembles a single Markdown document with one `##` section per fragment.
#[derive(Debug, Clone, Default)]
pub struct MarkdownAssembler;

impl MarkdownAssembler {
    pub fn new() -> Self {
        Self
    }

    fn convert(&self, fragment: &Fragment) -> Result<String> {
        let body = fragment.body.as_deref().ok_or_else(|| {
            FolioError::Assembly(format!("fragment {} has no body", fragment.index))
        })?;
        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg"])
            .build();
        let raw = converter.convert(body).map_err(|e| {
            FolioError::Assembly(format!(
                "fragment {} conversion failed: {e}",
                fragment.index
            ))
        })?;
        Ok(cleanup::run_pipeline(&raw))
    }
}

impl Assembler for MarkdownAssembler {
    #[instrument(skip_all, fields(id = %meta.id, fragments = fragments.len()))]
    fn assemble(&self, meta: &BundleMeta, fragments: &[Fragment]) -> Result<Vec<u8>> {
        if fragments.is_empty() {
            return Err(FolioError::Assembly("no fragments to assemble".into()));
        }

        let mut doc = build_frontmatter(meta, fragments.len());
        doc.push('\n');
        doc.push_str(&format!("# {}\n", meta.title));

        for fragment in fragments {
            let body = self.convert(fragment)?;
            doc.push('\n');
            doc.push_str(&format!("## {}\n\n", fragment.title));
            doc.push_str(&body);
        }

        debug!(bytes = doc.len(), "bundle assembled");
        Ok(doc.into_bytes())
    }

    fn extension(&self) -> &str {
        "md"
    }
}

/// Build a YAML frontmatter block.
fn build_frontmatter(meta: &BundleMeta, fragment_count: usize) -> String {
    let mut fm = String::from("---\n");
    fm.push_str(&format!("id: \"{}\"\n", escape_yaml_string(&meta.id)));
    fm.push_str(&format!("title: \"{}\"\n", escape_yaml_string(&meta.title)));
    fm.push_str(&format!("source_url: \"{}\"\n", escape_yaml_string(&meta.source_url)));
    fm.push_str(&format!("fragments: {fragment_count}\n"));
    fm.push_str(&format!("failed_fragments: {}\n", meta.failed_fragments));
    fm.push_str(&format!("assembled_at: \"{}\"\n", Utc::now().to_rfc3339()));
    fm.push_str("---\n");
    fm
}

fn escape_yaml_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> BundleMeta {
        BundleMeta {
            id: "lost-sea".into(),
            title: "The \"Lost\" Sea".into(),
            source_url: "https://example.com/book/lost-sea".into(),
            failed_fragments: 1,
        }
    }

    fn fragment(index: usize, title: &str, body: &str) -> Fragment {
        Fragment {
            index,
            title: title.into(),
            body: Some(body.into()),
        }
    }

    #[test]
    fn assembles_fragments_in_order() {
        let fragments = vec![
            fragment(0, "Chapter 1", "<h1>Dawn</h1><p>It was <em>dark</em>.</p>"),
            fragment(1, "Chapter 2", "<p>Then light.</p>"),
        ];

        let bytes = MarkdownAssembler::new().assemble(&meta(), &fragments).unwrap();
        let doc = String::from_utf8(bytes).unwrap();

        assert!(doc.starts_with("---\n"));
        assert!(doc.contains("title: \"The \\\"Lost\\\" Sea\""));
        assert!(doc.contains("fragments: 2\n"));
        assert!(doc.contains("failed_fragments: 1\n"));
        assert!(doc.contains("# The \"Lost\" Sea\n"));
        assert!(doc.contains("### Dawn"));
        assert!(doc.contains("dark"));

        let first = doc.find("## Chapter 1").unwrap();
        let second = doc.find("## Chapter 2").unwrap();
        assert!(first < second);
        assert!(doc.ends_with("Then light.\n"));
    }

    #[test]
    fn unresolved_fragment_is_assembly_error() {
        let fragments = vec![Fragment::pending(0, "Chapter 1")];
        let err = MarkdownAssembler::new()
            .assemble(&meta(), &fragments)
            .unwrap_err();
        assert!(matches!(err, FolioError::Assembly(_)));
    }

    #[test]
    fn empty_fragment_list_is_assembly_error() {
        let err = MarkdownAssembler::new().assemble(&meta(), &[]).unwrap_err();
        assert!(matches!(err, FolioError::Assembly(_)));
    }
}
