use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Unsupported archive format: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gzip,
    Bzip2,
    Tar,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gzip => "gz",
            Self::Bzip2 => "bz2",
            Self::Tar => "tar",
        })
    }
}

// anything ending like this is an archive, supported or not
const ARCHIVE_SUFFIXES: [&str; 9] = [
    ".tgz", ".tbz2", ".tbz", ".gz", ".bz2", ".xz", ".zst", ".zip", ".7z",
];

/// whether `name` looks like an archive at all, bare files and directories are not
pub fn is_archive(name: &str) -> bool {
    name.contains(".tar.")
        || name.ends_with(".tar")
        || ARCHIVE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Detect the archive format from the file name
pub fn detect_format(name: &str) -> Result<ArchiveFormat, ArchiveError> {
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArchiveFormat::Gzip)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") || name.ends_with(".tbz") {
        Ok(ArchiveFormat::Bzip2)
    } else if name.ends_with(".tar") {
        Ok(ArchiveFormat::Tar)
    } else {
        Err(ArchiveError::Unsupported(name.to_owned()))
    }
}

/// `tar` flag extracting `format`
pub fn extraction_flag(format: ArchiveFormat) -> &'static str {
    match format {
        ArchiveFormat::Gzip => "-xzf",
        ArchiveFormat::Bzip2 => "-xjf",
        ArchiveFormat::Tar => "-xf",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_format_maps_to_its_flag() {
        for (name, format, flag) in [
            ("openmpi-3.1.4.tar.bz2", ArchiveFormat::Bzip2, "-xjf"),
            ("openmpi-4.0.2.tar.gz", ArchiveFormat::Gzip, "-xzf"),
            ("l_mpi_2019.6.166.tgz", ArchiveFormat::Gzip, "-xzf"),
            ("mpich-3.3.tar", ArchiveFormat::Tar, "-xf"),
        ] {
            let detected = detect_format(name).unwrap();

            assert_eq!(detected, format, "{name}");
            assert_eq!(extraction_flag(detected), flag, "{name}");
        }
    }

    #[test]
    fn unsupported_archives_are_named() {
        assert_eq!(
            detect_format("mpich-3.3.tar.xz"),
            Err(ArchiveError::Unsupported("mpich-3.3.tar.xz".to_owned()))
        );
        assert!(detect_format("sources.zip").is_err());
        assert!(is_archive("mpich-3.3.tar.xz"));
    }

    #[test]
    fn bare_files_are_not_archives() {
        assert!(!is_archive("install.sh"));
        assert!(!is_archive("c_hello_world"));
        assert!(is_archive("openmpi-4.0.2.tar.gz"));
    }
}
