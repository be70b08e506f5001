//! Storage key generation.

use uuid::Uuid;

/// A fresh random key for `leaf_name`, keeping its lower-cased extension.
///
/// The leaf name itself never becomes part of the key; it is stored as
/// display metadata instead.
pub fn object_key_for(leaf_name: &str) -> String {
    let token = Uuid::new_v4();
    match extension_of(leaf_name) {
        Some(ext) => format!("{}.{}", token, ext),
        None => token.to_string(),
    }
}

/// Lower-cased extension after the last dot. A dotfile such as `.bashrc`
/// counts as all extension. Extensions with characters outside `[a-z0-9]`
/// are dropped rather than copied into the key.
fn extension_of(leaf_name: &str) -> Option<String> {
    let (_, ext) = leaf_name.trim().rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 16 {
        return None;
    }
    let ext = ext.to_ascii_lowercase();
    ext.chars()
        .all(|c| c.is_ascii_alphanumeric())
        .then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_lowercased_extension() {
        let key = object_key_for("Holiday.JPG");
        assert!(key.ends_with(".jpg"));
        assert_eq!(key.len(), 36 + 4);
        assert!(Uuid::parse_str(&key[..36]).is_ok());
    }

    #[test]
    fn uses_only_last_extension() {
        assert!(object_key_for("backup.tar.GZ").ends_with(".gz"));
    }

    #[test]
    fn dotfiles_keep_their_name_as_extension() {
        let key = object_key_for(".bashrc");
        assert!(key.ends_with(".bashrc"));
        assert!(Uuid::parse_str(&key[..36]).is_ok());
        assert!(object_key_for(".ENV").ends_with(".env"));
    }

    #[test]
    fn no_extension_yields_bare_token() {
        for name in ["Makefile", "trailing.", ".", "..", "weird.e/x", "spaced.t t"] {
            let key = object_key_for(name);
            assert_eq!(key.len(), 36, "{name}");
            assert!(Uuid::parse_str(&key).is_ok());
        }
    }

    #[test]
    fn keys_are_unique() {
        let a = object_key_for("a.txt");
        let b = object_key_for("a.txt");
        assert_ne!(a, b);
    }
}
