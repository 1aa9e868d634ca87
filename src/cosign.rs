use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, DigestAlgorithm};

use crate::registry::{Error, RepositoryClient};

/// Artifact type stamped on descriptors discovered through the legacy tag
/// convention, so verifiers can route them like native referrers.
pub const COSIGN_SIGNATURE_ARTIFACT_TYPE: &str = "application/vnd.dev.cosign.artifact.sig.v1+json";

/// Cosign's legacy signature-discovery tag for a subject digest:
/// `sha256-<hex>.sig`. Only sha256 subjects have one.
pub fn signature_tag(subject: &Digest) -> Option<String> {
    match subject.algorithm() {
        DigestAlgorithm::Sha256 => Some(format!(
            "{}-{}.sig",
            subject.algorithm().as_ref(),
            subject.digest()
        )),
        _ => None,
    }
}

/// Looks up the signature tag for `subject` in the same repository. A
/// missing tag contributes no referrer and is not an error.
pub async fn signature_descriptor(
    client: &RepositoryClient,
    subject: &Digest,
) -> Result<Option<Descriptor>, Error> {
    let Some(tag) = signature_tag(subject) else {
        return Ok(None);
    };
    let Some(resolved) = client.resolve_target(&tag, None).await? else {
        return Ok(None);
    };
    let descriptor = DescriptorBuilder::default()
        .media_type(resolved.media_type().clone())
        .digest(resolved.digest().clone())
        .size(resolved.size())
        .artifact_type(COSIGN_SIGNATURE_ARTIFACT_TYPE)
        .build()?;
    Ok(Some(descriptor))
}
