//! Caller identity and built-in authorization.
//!
//! Identity is derived once per connection from the verified client
//! certificate chain (see [`cert::Authenticator`]). The result is split in
//! two: [`AuthInformation`], which handlers can read, and
//! [`PermittedMethods`], which only the dispatcher consults.

pub mod cert;
pub mod owners;

pub use cert::{Authenticator, CertIdentity, GROUP_LIST_OID, PERMITTED_METHODS_OID};
pub use owners::{MetadataService, OwnerAllowlist, OwnerSet, OwnerSource};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Who is calling, as seen by a method handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInformation {
    /// Subject common name of the caller's certificate. Empty when anonymous.
    pub username: String,
    /// Groups embedded in the caller's certificate.
    pub group_list: BTreeSet<String>,
    /// True when the current call was permitted by the built-in checks or the
    /// service's grant callback, as opposed to merely being public.
    pub have_method_access: bool,
}

impl AuthInformation {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

/// Method patterns a connection may call without consulting the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermittedMethods {
    /// Every method is permitted.
    Unrestricted,
    /// Only methods matching one of these glob patterns.
    Patterns(BTreeSet<String>),
}

impl PermittedMethods {
    /// No built-in rights at all.
    pub fn none() -> Self {
        PermittedMethods::Patterns(BTreeSet::new())
    }

    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PermittedMethods::Patterns(patterns.into_iter().map(Into::into).collect())
    }

    /// Whether `service_method` matches any permitted pattern.
    pub fn allows(&self, service_method: &str) -> bool {
        match self {
            PermittedMethods::Unrestricted => true,
            PermittedMethods::Patterns(patterns) => patterns
                .iter()
                .any(|pattern| glob_match(pattern, service_method)),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PermittedMethods::Patterns(p) if p.is_empty())
    }
}

impl Default for PermittedMethods {
    fn default() -> Self {
        Self::none()
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Shell-style matching with the semantics certificates are written for:
/// `*` matches any run of characters except `/`, `?` matches one such
/// character, `[...]` is a character class (negated by a leading `^`) and
/// `\` makes the next character literal. A malformed pattern matches
/// nothing.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    compile_pattern(pattern).is_some_and(|pattern| pattern.matches_with(name, MATCH_OPTIONS))
}

/// Rewrite a certificate pattern into [`glob::Pattern`] syntax.
fn compile_pattern(pattern: &str) -> Option<Pattern> {
    let mut translated = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next()?;
                if !in_class && matches!(escaped, '*' | '?' | '[' | ']') {
                    translated.push('[');
                    translated.push(escaped);
                    translated.push(']');
                } else {
                    translated.push(escaped);
                }
            }
            // A run of stars means the same as one, and `**` is special to glob.
            '*' if !in_class => {
                while chars.next_if_eq(&'*').is_some() {}
                translated.push('*');
            }
            '[' if !in_class => {
                in_class = true;
                translated.push('[');
                if chars.next_if_eq(&'^').is_some() {
                    translated.push('!');
                }
            }
            ']' if in_class => {
                in_class = false;
                translated.push(']');
            }
            c => translated.push(c),
        }
    }
    if in_class {
        return None;
    }
    Pattern::new(&translated).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_patterns() {
        assert!(glob_match("*.*", "Hypervisor.CreateVm"));
        assert!(glob_match("Hypervisor.*", "Hypervisor.CreateVm"));
        assert!(!glob_match("Hypervisor.*", "ImageServer.AddImage"));
        assert!(glob_match("Hypervisor.CreateVm", "Hypervisor.CreateVm"));
        assert!(!glob_match("Hypervisor.CreateVm", "Hypervisor.CreateVmX"));
        assert!(glob_match("*.List*", "ImageServer.ListImages"));
        assert!(glob_match("Hyper?isor.*", "Hypervisor.Get"));
        assert!(!glob_match("*", "a/b"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
        assert!(glob_match("Hypervisor.**", "Hypervisor.GetVm"));
    }

    #[test]
    fn test_glob_character_classes() {
        assert!(glob_match("Hypervisor.[GL]et*", "Hypervisor.GetVm"));
        assert!(glob_match("Hypervisor.[GL]et*", "Hypervisor.LetGo"));
        assert!(!glob_match("Hypervisor.[GL]et*", "Hypervisor.SetVm"));
        assert!(glob_match("Hypervisor.[^S]et*", "Hypervisor.GetVm"));
        assert!(!glob_match("Hypervisor.[^S]et*", "Hypervisor.SetVm"));
        assert!(glob_match("Image[A-Z]erver.*", "ImageServer.ListImages"));
    }

    #[test]
    fn test_glob_escapes_are_literal() {
        assert!(glob_match("Hypervisor.\\*", "Hypervisor.*"));
        assert!(!glob_match("Hypervisor.\\*", "Hypervisor.GetVm"));
        assert!(glob_match("Hypervisor.Get\\?", "Hypervisor.Get?"));
        assert!(!glob_match("Hypervisor.Get\\?", "Hypervisor.GetX"));
        assert!(glob_match("Hyper\\visor.\\[x]", "Hypervisor.[x]"));
    }

    #[test]
    fn test_malformed_patterns_match_nothing() {
        assert!(!glob_match("Hypervisor.[Get", "Hypervisor.[Get"));
        assert!(!glob_match("Hypervisor.Get\\", "Hypervisor.Get\\"));
        assert!(!PermittedMethods::from_patterns(["Hypervisor.[Get"]).allows("Hypervisor.GetVm"));
    }

    #[test]
    fn test_permitted_methods() {
        let perms = PermittedMethods::from_patterns(["ImageServer.*", "Hypervisor.ListVMs"]);
        assert!(perms.allows("ImageServer.GetImage"));
        assert!(perms.allows("Hypervisor.ListVMs"));
        assert!(!perms.allows("Hypervisor.DestroyVm"));
        assert!(PermittedMethods::Unrestricted.allows("Anything.AtAll"));
        assert!(!PermittedMethods::none().allows("Anything.AtAll"));
        assert!(PermittedMethods::none().is_empty());
    }
}
