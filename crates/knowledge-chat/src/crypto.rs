//! Decryption seam for turn and knowledge text stored at rest.

/// Turns stored ciphertext back into text. Rows without the `encrypted` flag
/// never reach the cipher.
pub trait TextCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

/// Deployments without at-rest encryption.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

impl TextCipher for Plaintext {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// Decrypt `text` if `encrypted` is set, otherwise hand it back unchanged.
pub fn open_text(cipher: &dyn TextCipher, text: &str, encrypted: bool) -> anyhow::Result<String> {
    if encrypted {
        cipher.decrypt(text)
    } else {
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl TextCipher for Reverse {
        fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
            Ok(ciphertext.chars().rev().collect())
        }
    }

    #[test]
    fn test_open_text_only_decrypts_flagged_rows() {
        assert_eq!(open_text(&Reverse, "cba", true).unwrap(), "abc");
        assert_eq!(open_text(&Reverse, "cba", false).unwrap(), "cba");
        assert_eq!(open_text(&Plaintext, "abc", true).unwrap(), "abc");
    }
}
