//! Format conversion between steps

use std::path::Path;
use tracing::debug;

use super::context::{Artifact, ArtifactFormat};

/// Converts a step's output into the format the next step expects
pub trait FormatConverter: Send + Sync {
    /// Whether `from -> to` is available; checked when the pipeline is built
    fn supports(&self, from: ArtifactFormat, to: ArtifactFormat) -> bool;

    /// Convert `artifact`, writing any new file into `dir`
    fn convert(&self, artifact: &Artifact, to: ArtifactFormat, dir: &Path) -> Result<Artifact, String>;
}

/// Passes artifacts through when no format change is needed
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConverter;

impl FormatConverter for IdentityConverter {
    fn supports(&self, from: ArtifactFormat, to: ArtifactFormat) -> bool {
        from == to
    }

    fn convert(&self, artifact: &Artifact, to: ArtifactFormat, _dir: &Path) -> Result<Artifact, String> {
        debug!(from = %artifact.format, %to, "IdentityConverter::convert: called");
        if artifact.format != to {
            return Err(format!("no conversion from {} to {}", artifact.format, to));
        }
        Ok(artifact.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_identity_only_same_format() {
        let converter = IdentityConverter;
        assert!(converter.supports(ArtifactFormat::Text, ArtifactFormat::Text));
        assert!(!converter.supports(ArtifactFormat::Sdds, ArtifactFormat::Text));

        let artifact = Artifact {
            path: PathBuf::from("out.txt"),
            format: ArtifactFormat::Text,
        };
        let dir = Path::new(".");
        assert_eq!(converter.convert(&artifact, ArtifactFormat::Text, dir).unwrap(), artifact);
        assert!(converter.convert(&artifact, ArtifactFormat::Hdf5, dir).is_err());
    }
}
