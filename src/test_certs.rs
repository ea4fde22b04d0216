//! Certificates generated with `rcgen` at test time, replacing checked-in
//! DER fixtures.

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose, SanType};

/// Parameters for an X509-SVID leaf: one SPIFFE URI SAN, explicitly not a
/// CA, `digitalSignature` key usage.
pub(crate) fn leaf_params(spiffe_id: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.subject_alt_names = vec![SanType::URI(
        spiffe_id.try_into().expect("valid URI SAN string"),
    )];
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params
}

/// Parameters for a signing certificate: CA flag plus `keyCertSign`.
pub(crate) fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}

/// A generated leaf (plus optional issuing CA) with its private key.
pub(crate) struct CertChain {
    chain: Vec<Vec<u8>>,
    key: Vec<u8>,
}

impl CertChain {
    /// Self-signed leaf with the given SPIFFE ID.
    pub(crate) fn single(spiffe_id: &str) -> Self {
        Self::from_leaf_params(leaf_params(spiffe_id))
    }

    /// Self-signed leaf from custom parameters.
    pub(crate) fn from_leaf_params(params: CertificateParams) -> Self {
        let key = KeyPair::generate().expect("generate leaf key");
        let cert = params.self_signed(&key).expect("self-sign leaf");
        Self {
            chain: vec![cert.der().to_vec()],
            key: key.serialize_der(),
        }
    }

    /// CA-signed leaf; the chain is `[leaf, ca]`.
    pub(crate) fn with_ca(spiffe_id: &str) -> Self {
        let ca_key = KeyPair::generate().expect("generate ca key");
        let ca_cert = ca_params().self_signed(&ca_key).expect("self-sign ca");

        let leaf_key = KeyPair::generate().expect("generate leaf key");
        let leaf_cert = leaf_params(spiffe_id)
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .expect("sign leaf");

        Self {
            chain: vec![leaf_cert.der().to_vec(), ca_cert.der().to_vec()],
            key: leaf_key.serialize_der(),
        }
    }

    /// The concatenated DER chain, leaf first.
    pub(crate) fn chain_der(&self) -> Vec<u8> {
        self.chain.concat()
    }

    /// The leaf certificate DER.
    pub(crate) fn leaf_der(&self) -> &[u8] {
        &self.chain[0]
    }

    /// The issuing CA DER, when the chain has one.
    pub(crate) fn ca_der(&self) -> Option<&[u8]> {
        self.chain.get(1).map(Vec::as_slice)
    }

    /// The leaf private key as PKCS#8 DER.
    pub(crate) fn key_der(&self) -> Vec<u8> {
        self.key.clone()
    }
}

/// A standalone CA certificate in DER form, for bundle tests.
pub(crate) fn ca_der() -> Vec<u8> {
    let key = KeyPair::generate().expect("generate ca key");
    let cert = ca_params().self_signed(&key).expect("self-sign ca");
    cert.der().to_vec()
}
