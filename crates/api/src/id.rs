//! Types dealing with node and repository identity.

macro_rules! imp_deref {
    ($i:ty, $t:ty) => {
        impl std::ops::Deref for $i {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! imp_from {
    ($a:ty, $b:ty, $i:ident => $e:expr) => {
        impl From<$b> for $a {
            fn from($i: $b) -> Self {
                $e
            }
        }
    };
}

/// Identifies a node in the cluster.
///
/// A NodeId is the SHA-256 of the node's DER-encoded TLS leaf certificate,
/// rendered as unpadded upper-case base32. It is self-assigned, globally
/// unique, and the sole authentication token: a connection is trusted iff
/// the remote leaf certificate hashes to the configured NodeId.
///
/// NodeIds order lexicographically. This ordering is the deterministic
/// tie-break when two records carry an equal version counter, so it must
/// be total and agree on every node in the cluster.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub std::sync::Arc<str>);

imp_deref!(NodeId, str);
imp_from!(NodeId, String, s => NodeId(s.into_boxed_str().into()));
imp_from!(NodeId, &str, s => NodeId(s.into()));

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl NodeId {
    /// Derive the NodeId of a DER-encoded leaf certificate.
    pub fn from_cert_der(der: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(der);
        data_encoding::BASE32_NOPAD.encode(&digest).into()
    }

    /// A short prefix of the id, for log line context.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(5)]
    }
}

/// Identifies a repository: a short operator-assigned label.
///
/// A repository exists on a node iff the node's configuration lists it;
/// two nodes sharing a RepoId are expected to sync it.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct RepoId(pub std::sync::Arc<str>);

imp_deref!(RepoId, str);
imp_from!(RepoId, String, s => RepoId(s.into_boxed_str().into()));
imp_from!(RepoId, &str, s => RepoId(s.into()));

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_id_fixtures() {
        // Unpadded upper-case base32 of the sha256 of the input.
        const F: &[(&[u8], &str)] = &[
            (
                b"",
                "4OYMIQUY7QOBJGX36TEJS35ZEQT24QPEMSNZGTFESWMRW6CSXBKQ",
            ),
            (
                b"hello",
                "FTZE3OS7WCRQ4JXIHMVMLOPCTYNRMHS4D6TUEXTTAQZWFE4LTASA",
            ),
        ];

        for (der, id) in F.iter() {
            assert_eq!(*id, &*NodeId::from_cert_der(der).0);
        }
    }

    #[test]
    fn node_id_order_is_total() {
        let a = NodeId::from("AAAA");
        let b = NodeId::from("BBBB");
        assert!(a < b);
        assert_eq!(a, NodeId::from("AAAA"));
        assert_eq!(a.cmp(&b).reverse(), b.cmp(&a));
    }

    #[test]
    fn short_prefix() {
        let id = NodeId::from_cert_der(b"x");
        assert_eq!(5, id.short().len());
        assert!(id.0.starts_with(id.short()));
    }
}
