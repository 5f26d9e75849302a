//! Field-level sealing of [`SecretFields`]

use tracing::warn;

use crate::models::deployment::SecretFields;
use crate::secrets::codec::{is_sealed, SecretsCodec, SecretsError};

/// Plaintext credentials opened from a stored record
#[derive(Debug, Clone)]
pub struct OpenedSecrets {
    pub fields: SecretFields,

    /// Names of fields that were stored as legacy plaintext
    pub legacy_fields: Vec<&'static str>,
}

impl OpenedSecrets {
    /// Whether the record must be re-sealed on its next write.
    pub fn needs_reseal(&self) -> bool {
        !self.legacy_fields.is_empty()
    }
}

/// Seal every present field.
///
/// `fields` must hold plaintext. Every value is encrypted, including one that
/// happens to look like a sealed token.
pub fn seal_fields(codec: &SecretsCodec, fields: &SecretFields) -> Result<SecretFields, SecretsError> {
    fields.try_map(|_, value| codec.encrypt(value))
}

/// Open every present field.
///
/// A field that does not have the sealed-token shape is legacy plaintext: it
/// is returned unchanged and reported in `legacy_fields`. A field that has
/// the shape but fails to decrypt is an error.
pub fn open_fields(codec: &SecretsCodec, fields: &SecretFields) -> Result<OpenedSecrets, SecretsError> {
    let mut legacy_fields = Vec::new();
    let opened = fields.try_map(|name, value| {
        if is_sealed(value) {
            codec.decrypt(value)
        } else {
            warn!(field = name, "Secret field stored as plaintext, will be re-sealed");
            legacy_fields.push(name);
            Ok(value.to_string())
        }
    })?;

    Ok(OpenedSecrets {
        fields: opened,
        legacy_fields,
    })
}
