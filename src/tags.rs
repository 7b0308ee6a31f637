//! Locale tag catalogue.
//!
//! SMA devices report most enumerated values as numeric tag ids; the meaning
//! lives in a per-locale text file (`TagList<locale>.txt`) shipped next to
//! the binary. Line format: `tag_id=tag\lri\description`, `#` starts a
//! comment.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

const FALLBACK_LOCALE: &str = "en-US";

#[derive(Debug, Clone, Default)]
pub struct TagDef {
    pub tag: String,
    pub lri: u32,
    pub description: String,
}

#[derive(Debug, Default)]
pub struct TagCatalog {
    defs: BTreeMap<u32, TagDef>,
}

impl TagCatalog {
    /// Load the catalogue for `locale` from `dir`, falling back to en-US.
    pub fn load(dir: &Path, locale: &str) -> Result<TagCatalog> {
        let path = dir.join(format!("TagList{}.txt", locale.to_uppercase()));
        match std::fs::File::open(&path) {
            Ok(file) => Self::read_from(std::io::BufReader::new(file))
                .with_context(|| format!("reading {}", path.display())),
            Err(err) if !locale.eq_ignore_ascii_case(FALLBACK_LOCALE) => {
                warn!(path = %path.display(), %err, "locale tag list missing, falling back to en-US");
                let fallback = dir.join(format!("TagList{}.txt", FALLBACK_LOCALE.to_uppercase()));
                let file = std::fs::File::open(&fallback)
                    .with_context(|| format!("opening {}", fallback.display()))?;
                Self::read_from(std::io::BufReader::new(file))
                    .with_context(|| format!("reading {}", fallback.display()))
            }
            Err(err) => Err(err).with_context(|| format!("opening {}", path.display())),
        }
    }

    /// Parse catalogue lines from any reader.
    pub fn read_from<R: BufRead>(reader: R) -> Result<TagCatalog> {
        let mut defs = BTreeMap::new();

        for (lineno, line) in reader.lines().enumerate() {
            let mut line = line?;
            if let Some(hash) = line.find(['#', '\r']) {
                line.truncate(hash);
            }
            if line.is_empty() {
                continue;
            }

            let Some((id_part, rest)) = line.split_once('=') else {
                debug!(line = lineno + 1, "tag list line without '='");
                continue;
            };
            let fields: Vec<&str> = rest.split('\\').collect();
            if fields.len() != 3 {
                warn!(line = lineno + 1, "tag list line with wrong field count");
                continue;
            }
            let Ok(tag_id) = id_part.trim().parse::<u32>() else {
                warn!(line = lineno + 1, "invalid tag id");
                continue;
            };
            let Ok(lri) = fields[1].trim().parse::<u32>() else {
                warn!(line = lineno + 1, "invalid LRI");
                continue;
            };

            defs.insert(
                tag_id,
                TagDef {
                    tag: fields[0].trim().to_string(),
                    lri,
                    description: fields[2].trim().to_string(),
                },
            );
        }

        Ok(TagCatalog { defs })
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn get(&self, tag_id: u32) -> Option<&TagDef> {
        self.defs.get(&tag_id)
    }

    pub fn description(&self, tag_id: u32) -> Option<&str> {
        self.defs.get(&tag_id).map(|d| d.description.as_str())
    }

    pub fn description_or<'a>(&'a self, tag_id: u32, default: &'a str) -> &'a str {
        self.description(tag_id).unwrap_or(default)
    }

    pub fn tag_name(&self, tag_id: u32) -> Option<&str> {
        self.defs.get(&tag_id).map(|d| d.tag.as_str())
    }

    /// Lookup by Logical Record Index; the instance byte is masked off.
    pub fn description_for_lri(&self, lri: u32) -> Option<&str> {
        let lri = lri & 0x00FF_FF00;
        self.defs
            .values()
            .find(|d| d.lri == lri)
            .map(|d| d.description.as_str())
    }

    pub fn tag_id_for_lri(&self, lri: u32) -> Option<u32> {
        let lri = lri & 0x00FF_FF00;
        self.defs
            .iter()
            .find(|(_, d)| d.lri == lri)
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# TagListEN-US.txt extract
35=Fault\\0\\Fault
51=Closed\\0\\Closed
311=Open\\0\\Open
307=Ok\\0\\Ok
418=degC\\0\\\u{b0}C
830=Stt\\2181632\\Status\n";

    fn catalog() -> TagCatalog {
        TagCatalog::read_from(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn parses_entries_and_skips_comments() {
        let tags = catalog();
        assert_eq!(tags.len(), 6);
        assert_eq!(tags.description(307), Some("Ok"));
        assert_eq!(tags.tag_name(51), Some("Closed"));
    }

    #[test]
    fn lri_lookup_masks_instance_byte() {
        let tags = catalog();
        // 2181632 == 0x00214A00
        assert_eq!(tags.description_for_lri(0x0021_4A7F), Some("Status"));
        assert_eq!(tags.tag_id_for_lri(0x0021_4A00), Some(830));
        assert_eq!(tags.description_for_lri(0x0099_0000), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let input = "abc=x\\y\\z\n42=only-two\\fields\n9=ok\\0\\Fine\n";
        let tags = TagCatalog::read_from(input.as_bytes()).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.description(9), Some("Fine"));
    }

    #[test]
    fn missing_description_defaults() {
        let tags = catalog();
        assert_eq!(tags.description_or(99999, "?"), "?");
    }
}
