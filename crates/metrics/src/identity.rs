//! Cross-session identity resolution.
//!
//! Every touchpoint (session, account, CRM lead, hashed email or phone) is an
//! identity node pointing at a person key. A batch of events presents a set of
//! tokens; if any of them is already linked, that person key is reused,
//! otherwise a fresh key is minted from the strongest token.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use store::{EventMetadata, IdentityNode, IdentityRefs, IdentityRepository, IdentityType, StoreError, UserId};
use tracing::debug;

use crate::error::Result;
use crate::events::IngestContext;

/// Strongest identity first
const PREFERENCE: [IdentityType; 5] = [
    IdentityType::User,
    IdentityType::CrmLead,
    IdentityType::EmailHash,
    IdentityType::PhoneHash,
    IdentityType::Session,
];

/// Identity tokens presented by one batch or request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityTokens {
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub crm_lead_id: Option<String>,
    pub email_hash: Option<String>,
    pub phone_hash: Option<String>,
}

impl IdentityTokens {
    /// Collect tokens from the context plus the metadata of every event.
    ///
    /// Context values win; metadata only fills what the context lacks.
    pub fn extract<'a>(ctx: &IngestContext, metadata: impl IntoIterator<Item = &'a EventMetadata>) -> Self {
        let mut tokens = IdentityTokens {
            user_id: ctx.user_id,
            session_id: ctx.session_id.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
            crm_lead_id: ctx.crm_lead_id.as_deref().and_then(sanitize_text),
            email_hash: ctx.customer_email.as_deref().and_then(sanitize_email).map(|e| hash_identity(&e)),
            phone_hash: ctx.customer_phone.as_deref().and_then(sanitize_phone).map(|p| hash_identity(&p)),
        };

        for meta in metadata {
            if tokens.crm_lead_id.is_none() {
                tokens.crm_lead_id = meta.crm_lead_id.as_deref().and_then(sanitize_text);
            }
            if tokens.email_hash.is_none() {
                tokens.email_hash = meta
                    .customer_email
                    .as_deref()
                    .and_then(sanitize_email)
                    .map(|e| hash_identity(&e))
                    .or_else(|| meta.customer_email_hash.as_deref().and_then(sanitize_text));
            }
            if tokens.phone_hash.is_none() {
                tokens.phone_hash = meta
                    .customer_phone
                    .as_deref()
                    .and_then(sanitize_phone)
                    .map(|p| hash_identity(&p))
                    .or_else(|| meta.customer_phone_hash.as_deref().and_then(sanitize_text));
            }
        }
        tokens
    }

    /// Present tokens as `(type, value)` pairs in preference order
    pub fn pairs(&self) -> Vec<(IdentityType, String)> {
        PREFERENCE
            .iter()
            .filter_map(|kind| self.value(*kind).map(|value| (*kind, value)))
            .collect()
    }

    fn value(&self, kind: IdentityType) -> Option<String> {
        match kind {
            IdentityType::User => self.user_id.map(|id| id.to_string()),
            IdentityType::CrmLead => self.crm_lead_id.clone(),
            IdentityType::EmailHash => self.email_hash.clone(),
            IdentityType::PhoneHash => self.phone_hash.clone(),
            IdentityType::Session => self.session_id.clone(),
        }
    }

    fn refs(&self) -> IdentityRefs {
        IdentityRefs {
            user_id: self.user_id,
            session_id: self.session_id.clone(),
            crm_lead_id: self.crm_lead_id.clone(),
        }
    }
}

/// Person key minted for a fresh identity
pub fn person_key_for(kind: IdentityType, value: &str) -> String {
    match kind {
        IdentityType::User => format!("user:{value}"),
        IdentityType::CrmLead => format!("lead:{value}"),
        IdentityType::EmailHash => format!("email:{}", prefix(value, 24)),
        IdentityType::PhoneHash => format!("phone:{}", prefix(value, 24)),
        IdentityType::Session => format!("session:{value}"),
    }
}

fn prefix(value: &str, len: usize) -> &str {
    value.get(..len).unwrap_or(value)
}

fn sanitize_text(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.chars().take(256).collect())
    }
}

/// Lower-cased email if it looks like `local@domain.tld`
pub fn sanitize_email(raw: &str) -> Option<String> {
    let value = raw.trim().to_lowercase();
    if value.len() > 320 || value.chars().any(char::is_whitespace) {
        return None;
    }
    let (local, domain) = value.split_once('@')?;
    if local.is_empty() || domain.contains('@') {
        return None;
    }
    let (host, tld) = domain.rsplit_once('.')?;
    if host.is_empty() || tld.is_empty() {
        return None;
    }
    Some(value)
}

/// Phone reduced to digits and `+`; fewer than 7 characters is not a phone
pub fn sanitize_phone(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    if cleaned.len() < 7 {
        return None;
    }
    Some(cleaned.chars().take(24).collect())
}

/// First 40 hex characters of the SHA-256 digest
pub fn hash_identity(value: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(value.as_bytes()));
    digest[..40].to_string()
}

/// Resolves tokens to person keys and maintains the identity graph
#[derive(Clone)]
pub struct IdentityResolver {
    repo: Arc<dyn IdentityRepository>,
}

impl IdentityResolver {
    pub fn new(repo: Arc<dyn IdentityRepository>) -> Self {
        Self { repo }
    }

    /// Upsert one node and return it as stored.
    ///
    /// An existing node keeps its person key; only empty refs are filled.
    pub fn link_identity(
        &self,
        identity_type: IdentityType,
        value: &str,
        person_key: &str,
        refs: &IdentityRefs,
        seen_at: DateTime<Utc>,
    ) -> Result<IdentityNode> {
        self.repo.upsert_identity(identity_type, value, person_key, refs, seen_at)?;
        let node = self
            .repo
            .find_identity(identity_type, value)?
            .ok_or_else(|| StoreError::InvalidValue {
                field: identity_type.as_str().to_string(),
                value: value.to_string(),
            })?;
        Ok(node)
    }

    /// Resolve the tokens to one person key and link all of them to it.
    ///
    /// Returns `None` when no token is present.
    pub fn resolve(&self, tokens: &IdentityTokens, seen_at: DateTime<Utc>) -> Result<Option<String>> {
        let pairs = tokens.pairs();
        let Some((first_kind, first_value)) = pairs.first() else {
            return Ok(None);
        };

        let mut person_key = None;
        for (kind, value) in &pairs {
            if let Some(node) = self.repo.find_identity(*kind, value)? {
                person_key = Some(node.person_key);
                break;
            }
        }
        let person_key = person_key.unwrap_or_else(|| person_key_for(*first_kind, first_value));

        let refs = tokens.refs();
        for (kind, value) in &pairs {
            self.link_identity(*kind, value, &person_key, &refs, seen_at)?;
        }
        debug!(person_key = %person_key, tokens = pairs.len(), "resolved identity");
        Ok(Some(person_key))
    }

    /// Every person key linked to the given user or session, deduplicated
    pub fn person_keys_for(&self, user_id: Option<UserId>, session_id: Option<&str>) -> Result<Vec<String>> {
        let mut lookups = Vec::new();
        if let Some(id) = user_id {
            lookups.push((IdentityType::User, id.to_string()));
        }
        if let Some(sid) = session_id.map(str::trim).filter(|s| !s.is_empty()) {
            lookups.push((IdentityType::Session, sid.to_string()));
        }

        let mut keys: Vec<String> = Vec::new();
        for (kind, value) in lookups {
            if let Some(node) = self.repo.find_identity(kind, &value)? {
                if !keys.contains(&node.person_key) {
                    keys.push(node.person_key);
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::SqliteStore;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(SqliteStore::in_memory().unwrap()))
    }

    #[test]
    fn test_sanitizers() {
        assert_eq!(sanitize_email(" Rider@Example.COM "), Some("rider@example.com".to_string()));
        assert_eq!(sanitize_email("not-an-email"), None);
        assert_eq!(sanitize_email("a@b"), None);
        assert_eq!(sanitize_phone("+49 (151) 234-5678"), Some("+491512345678".to_string()));
        assert_eq!(sanitize_phone("123"), None);
    }

    #[test]
    fn test_hash_is_forty_hex_chars() {
        let hash = hash_identity("rider@example.com");
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_identity("rider@example.com"));
    }

    #[test]
    fn test_fresh_key_prefers_strongest_token() {
        let resolver = resolver();
        let tokens = IdentityTokens {
            user_id: Some(42),
            session_id: Some("s1".to_string()),
            ..IdentityTokens::default()
        };
        let key = resolver.resolve(&tokens, Utc::now()).unwrap();
        assert_eq!(key.as_deref(), Some("user:42"));
        assert_eq!(resolver.person_keys_for(None, Some("s1")).unwrap(), vec!["user:42".to_string()]);
    }

    #[test]
    fn test_existing_session_key_is_reused_after_login() {
        let resolver = resolver();
        let anonymous = IdentityTokens {
            session_id: Some("s1".to_string()),
            ..IdentityTokens::default()
        };
        assert_eq!(resolver.resolve(&anonymous, Utc::now()).unwrap().as_deref(), Some("session:s1"));

        let logged_in = IdentityTokens {
            user_id: Some(7),
            session_id: Some("s1".to_string()),
            ..IdentityTokens::default()
        };
        assert_eq!(resolver.resolve(&logged_in, Utc::now()).unwrap().as_deref(), Some("session:s1"));
        assert_eq!(
            resolver.person_keys_for(Some(7), Some("s1")).unwrap(),
            vec!["session:s1".to_string()]
        );
    }

    #[test]
    fn test_link_identity_keeps_existing_person_key() {
        let resolver = resolver();
        let refs = IdentityRefs::default();
        resolver
            .link_identity(IdentityType::EmailHash, "abc", "email:abc", &refs, Utc::now())
            .unwrap();
        let node = resolver
            .link_identity(
                IdentityType::EmailHash,
                "abc",
                "user:1",
                &IdentityRefs { user_id: Some(1), ..IdentityRefs::default() },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(node.person_key, "email:abc");
        assert_eq!(node.user_id, Some(1));
    }

    #[test]
    fn test_extract_reads_metadata_when_context_is_silent() {
        let ctx = IngestContext::for_session("s9");
        let meta = EventMetadata {
            customer_email: Some("Buyer@Shop.de".to_string()),
            crm_lead_id: Some("L-77".to_string()),
            ..EventMetadata::default()
        };
        let tokens = IdentityTokens::extract(&ctx, [&meta]);
        assert_eq!(tokens.crm_lead_id.as_deref(), Some("L-77"));
        assert_eq!(tokens.email_hash, Some(hash_identity("buyer@shop.de")));
        assert_eq!(
            tokens.pairs().first().map(|(kind, _)| *kind),
            Some(IdentityType::CrmLead)
        );
    }

    #[test]
    fn test_no_tokens_resolves_to_none() {
        assert_eq!(resolver().resolve(&IdentityTokens::default(), Utc::now()).unwrap(), None);
    }
}
