//! Immutable table of commands the installer may run.

use serde::Serialize;
use std::collections::BTreeMap;

/// Binary → allowed argument prefixes.
///
/// A call is allowed when its binary is a key and its argument list
/// starts with one of that key's prefixes, compared element-wise and
/// exactly. Trailing arguments beyond the prefix are permitted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CommandWhitelist {
    entries: BTreeMap<String, Vec<Vec<String>>>,
}

impl CommandWhitelist {
    pub fn new<B, P, A>(entries: impl IntoIterator<Item = (B, P)>) -> Self
    where
        B: Into<String>,
        P: IntoIterator<Item = A>,
        A: IntoIterator<Item = &'static str>,
    {
        let mut table: BTreeMap<String, Vec<Vec<String>>> = BTreeMap::new();
        for (binary, prefixes) in entries {
            table.entry(binary.into()).or_default().extend(
                prefixes
                    .into_iter()
                    .map(|p| p.into_iter().map(str::to_string).collect()),
            );
        }
        Self { entries: table }
    }

    /// The table shipped with the installer.
    pub fn installer_default() -> Self {
        Self::new([
            (
                "php",
                vec![
                    vec!["artisan", "migrate", "--force"],
                    vec!["artisan", "db:seed", "--force"],
                    vec!["artisan", "key:generate", "--force"],
                    vec!["artisan", "config:cache"],
                    vec!["artisan", "config:clear"],
                    vec!["artisan", "cache:clear"],
                    vec!["artisan", "route:cache"],
                    vec!["artisan", "view:cache"],
                    vec!["artisan", "storage:link"],
                    vec!["artisan", "optimize"],
                    vec!["artisan", "optimize:clear"],
                ],
            ),
            (
                "composer",
                vec![
                    vec!["install", "--no-dev", "--optimize-autoloader"],
                    vec!["dump-autoload"],
                ],
            ),
        ])
    }

    pub fn allows(&self, binary: &str, args: &[String]) -> bool {
        self.entries.get(binary).is_some_and(|prefixes| {
            prefixes.iter().any(|prefix| {
                prefix.len() <= args.len() && prefix.iter().zip(args).all(|(p, a)| p == a)
            })
        })
    }

    /// Entries for display, one `(binary, prefix)` pair per allowed form.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().flat_map(|(binary, prefixes)| {
            prefixes
                .iter()
                .map(move |prefix| (binary.as_str(), prefix.as_slice()))
        })
    }

    pub fn binaries(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
