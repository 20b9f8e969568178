//! Sound card discovery by driver name.
//!
//! Cards come and go (USB headsets, Bluetooth links), so nothing here
//! caches: every call goes back to the lookup.

use std::path::{Path, PathBuf};

/// Maps a driver name to a card index.
pub trait CardLookup: Send + Sync {
    /// Returns the index of the card registered under `driver_name`.
    fn resolve_card(&self, driver_name: &str) -> Option<u32>;
}

/// Looks cards up through the ALSA proc tree.
///
/// `/proc/asound/<name>` is a symlink to `card<N>` for every present card.
#[derive(Debug, Clone)]
pub struct ProcAsound {
    root: PathBuf,
}

impl ProcAsound {
    /// Uses `/proc/asound`.
    pub fn new() -> Self {
        Self::with_root("/proc/asound")
    }

    /// Uses a different root directory, e.g. a fake tree in tests.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for ProcAsound {
    fn default() -> Self {
        Self::new()
    }
}

impl CardLookup for ProcAsound {
    fn resolve_card(&self, driver_name: &str) -> Option<u32> {
        let link = self.root.join(driver_name);
        let target = match std::fs::read_link(&link) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(path = %link.display(), error = %e, "card link not readable");
                return None;
            }
        };

        let index = target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("card"))
            .and_then(|digits| digits.parse().ok());

        if index.is_none() {
            tracing::warn!(
                path = %link.display(),
                target = %target.display(),
                "card link does not point at card<N>"
            );
        }
        index
    }
}

/// Picks the first present card from an ordered candidate list.
#[derive(Debug, Clone)]
pub struct CardResolver {
    candidates: Vec<String>,
    dummy_index: u32,
}

impl CardResolver {
    /// Creates a resolver over `candidates`, falling back to `dummy_index`.
    pub fn new(candidates: Vec<String>, dummy_index: u32) -> Self {
        Self {
            candidates,
            dummy_index,
        }
    }

    /// Returns the candidate driver names in probe order.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Returns the fallback card index.
    pub fn dummy_index(&self) -> u32 {
        self.dummy_index
    }

    /// Returns the first candidate that exists, or the dummy index.
    pub fn resolve(&self, lookup: &dyn CardLookup) -> u32 {
        self.resolve_with(lookup, |_| true)
    }

    /// Like [`resolve`](Self::resolve), but a found card is only taken if
    /// `accept` agrees (e.g. it exposes the wanted PCM).
    pub fn resolve_with(&self, lookup: &dyn CardLookup, accept: impl Fn(u32) -> bool) -> u32 {
        for name in &self.candidates {
            match lookup.resolve_card(name) {
                Some(index) if accept(index) => {
                    tracing::debug!(card = index, name = %name, "card resolved");
                    return index;
                }
                Some(index) => {
                    tracing::debug!(card = index, name = %name, "card present but unusable");
                }
                None => {}
            }
        }

        tracing::warn!(
            candidates = ?self.candidates,
            dummy = self.dummy_index,
            "no candidate card present, using dummy card"
        );
        self.dummy_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticCards(HashMap<&'static str, u32>);

    impl CardLookup for StaticCards {
        fn resolve_card(&self, driver_name: &str) -> Option<u32> {
            self.0.get(driver_name).copied()
        }
    }

    fn resolver() -> CardResolver {
        CardResolver::new(
            vec!["PCH".to_string(), "Intel".to_string(), "sofhdadsp".to_string()],
            99,
        )
    }

    #[test]
    fn test_resolves_third_candidate() {
        let cards = StaticCards(HashMap::from([("sofhdadsp", 4)]));
        assert_eq!(resolver().resolve(&cards), 4);
    }

    #[test]
    fn test_falls_back_to_dummy() {
        let cards = StaticCards(HashMap::new());
        assert_eq!(resolver().resolve(&cards), 99);
    }

    #[test]
    fn test_prefers_earlier_candidate() {
        let cards = StaticCards(HashMap::from([("Intel", 1), ("sofhdadsp", 2)]));
        assert_eq!(resolver().resolve(&cards), 1);
    }

    #[test]
    fn test_resolve_with_skips_rejected_cards() {
        let cards = StaticCards(HashMap::from([("PCH", 0), ("Intel", 1)]));
        assert_eq!(resolver().resolve_with(&cards, |index| index != 0), 1);
        assert_eq!(resolver().resolve_with(&cards, |_| false), 99);
    }

    #[cfg(unix)]
    #[test]
    fn test_proc_asound_reads_links() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        symlink("card2", dir.path().join("btaudiosource")).unwrap();
        symlink("card0", dir.path().join("PCH")).unwrap();
        symlink("controlC0", dir.path().join("Broken")).unwrap();

        let lookup = ProcAsound::with_root(dir.path());
        assert_eq!(lookup.resolve_card("btaudiosource"), Some(2));
        assert_eq!(lookup.resolve_card("PCH"), Some(0));
        assert_eq!(lookup.resolve_card("Broken"), None);
        assert_eq!(lookup.resolve_card("Missing"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_proc_asound_with_resolver() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        symlink("card3", dir.path().join("sofhdadsp")).unwrap();

        let lookup = ProcAsound::with_root(dir.path());
        assert_eq!(resolver().resolve(&lookup), 3);
    }
}
