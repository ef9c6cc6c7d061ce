//! The `settings.toml` document: folder roles and links to external library services.

use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::GraphError,
    properties::{RecordId, RecordType},
};

pub const SETTINGS_FILE: &str = "settings.toml";

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// A secret encrypted with ChaCha20-Poly1305 under a key derived from a passphrase with Argon2id.
/// `data` carries the authentication tag. Every field is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub salt: String,
    pub nonce: String,
    pub data: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], GraphError> {
    let mut key = [0u8; 32];
    Argon2::default().hash_password_into(passphrase.as_bytes(), salt, &mut key)?;
    Ok(key)
}

fn cipher(passphrase: &str, salt: &[u8]) -> Result<ChaCha20Poly1305, GraphError> {
    let key = derive_key(passphrase, salt)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}

impl SealedSecret {
    pub fn seal(secret: &str, passphrase: &str) -> Result<SealedSecret, GraphError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut salt)?;
        getrandom::getrandom(&mut nonce)?;
        let data = cipher(passphrase, &salt)?
            .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
            .map_err(|e| GraphError::Serialization(format!("Credential encryption failed: {e}")))?;
        Ok(SealedSecret {
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            data: STANDARD.encode(data),
        })
    }

    /// Decrypt with `passphrase`. A wrong passphrase or tampered data fails authentication.
    pub fn open(&self, passphrase: &str) -> Result<String, GraphError> {
        let salt = STANDARD.decode(&self.salt)?;
        let nonce = STANDARD.decode(&self.nonce)?;
        let data = STANDARD.decode(&self.data)?;
        if nonce.len() != NONCE_LEN {
            return Err(GraphError::Serialization(format!(
                "Credential nonce must be {NONCE_LEN} bytes, found {}",
                nonce.len()
            )));
        }
        let plain = cipher(passphrase, &salt)?
            .decrypt(Nonce::from_slice(&nonce), data.as_slice())
            .map_err(|_| {
                GraphError::Serialization(
                    "Credential check failed: wrong passphrase or damaged settings".to_string(),
                )
            })?;
        String::from_utf8(plain)
            .map_err(|e| GraphError::Serialization(format!("Credential is not UTF-8: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryLink {
    pub name: String,
    pub service: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<SealedSecret>,
}

impl LibraryLink {
    pub fn new(name: &str, service: &str, user: &str) -> Self {
        LibraryLink {
            name: name.to_string(),
            service: service.to_string(),
            user: user.to_string(),
            credential: None,
        }
    }

    pub fn set_credential(&mut self, secret: &str, passphrase: &str) -> Result<(), GraphError> {
        self.credential = Some(SealedSecret::seal(secret, passphrase)?);
        Ok(())
    }

    pub fn credential(&self, passphrase: &str) -> Result<Option<String>, GraphError> {
        self.credential
            .as_ref()
            .map(|sealed| sealed.open(passphrase))
            .transpose()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// role name -> folder number
    #[serde(default)]
    pub folder_roles: BTreeMap<String, u32>,
    #[serde(default, rename = "library_link")]
    pub library_links: Vec<LibraryLink>,
}

impl Settings {
    pub fn parse(content: &str) -> Result<Settings, GraphError> {
        Ok(toml::from_str(content)?)
    }

    pub fn render(&self) -> Result<String, GraphError> {
        Ok(toml::to_string(self)?)
    }

    pub fn folder_for_role(&self, role: &str) -> Option<RecordId> {
        self.folder_roles
            .get(role)
            .map(|number| RecordId::new(RecordType::Folder, *number))
    }

    pub fn link(&self, name: &str) -> Option<&LibraryLink> {
        self.library_links.iter().find(|link| link.name == name)
    }

    pub fn link_mut(&mut self, name: &str) -> Option<&mut LibraryLink> {
        self.library_links.iter_mut().find(|link| link.name == name)
    }

    /// Forget roles pointing at folders that do not exist. Returns the dropped role names.
    pub fn retain_folders<F: Fn(RecordId) -> bool>(&mut self, exists: F) -> Vec<String> {
        let mut dropped = Vec::new();
        self.folder_roles.retain(|role, number| {
            let keep = exists(RecordId::new(RecordType::Folder, *number));
            if !keep {
                tracing::warn!("Dropping folder role '{role}': folder:{number} does not exist");
                dropped.push(role.clone());
            }
            keep
        });
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_sealed_secret_round_trip() {
        let sealed = SealedSecret::seal("hunter2 with a longer tail than one block", "pass").unwrap();
        assert_eq!(
            sealed.open("pass").unwrap(),
            "hunter2 with a longer tail than one block"
        );
        assert!(matches!(
            sealed.open("wrong"),
            Err(GraphError::Serialization(_))
        ));

        let again = SealedSecret::seal("hunter2 with a longer tail than one block", "pass").unwrap();
        assert_ne!(again.salt, sealed.salt);
        assert_ne!(again.nonce, sealed.nonce);
        assert_ne!(again.data, sealed.data);
    }

    #[test]
    fn test_sealed_secret_rejects_tampering() {
        let sealed = SealedSecret::seal("s3cret", "pass").unwrap();

        let mut data = STANDARD.decode(&sealed.data).unwrap();
        data[0] ^= 1;
        let flipped = SealedSecret {
            data: STANDARD.encode(&data),
            ..sealed.clone()
        };
        assert!(matches!(
            flipped.open("pass"),
            Err(GraphError::Serialization(_))
        ));

        let resalted = SealedSecret {
            salt: STANDARD.encode([7u8; SALT_LEN]),
            ..sealed.clone()
        };
        assert!(resalted.open("pass").is_err());

        let short_nonce = SealedSecret {
            nonce: STANDARD.encode([0u8; 4]),
            ..sealed
        };
        assert!(matches!(
            short_nonce.open("pass"),
            Err(GraphError::Serialization(_))
        ));
    }

    #[test]
    fn test_settings_document() {
        let mut settings = Settings::default();
        settings.folder_roles.insert("inbox".to_string(), 4);
        settings.folder_roles.insert("trash".to_string(), 9);
        let mut link = LibraryLink::new("home", "zotero", "ada");
        link.set_credential("s3cret", "key").unwrap();
        settings.library_links.push(link);

        let rendered = settings.render().unwrap();
        assert!(rendered.contains("[[library_link]]"));
        assert!(!rendered.contains("s3cret"));
        let mut parsed = Settings::parse(&rendered).unwrap();
        assert_eq!(parsed, settings);
        assert_eq!(
            parsed.link("home").unwrap().credential("key").unwrap().as_deref(),
            Some("s3cret")
        );

        let dropped = parsed.retain_folders(|id| id.number == 4);
        assert_eq!(dropped, vec!["trash".to_string()]);
        assert_eq!(
            parsed.folder_for_role("inbox"),
            Some(RecordId::new(RecordType::Folder, 4))
        );
    }
}
