//! Metadata fetcher/parser (component B): turns raw `Release`/`Packages`/
//! `Sources` bytes into the set of [`Artifact`]s a repository wants, using
//! `proxmox_apt`'s deb822 parser for the RFC822-ish stanza grammar.

use std::{collections::HashMap, io::Read};

use anyhow::{format_err, Error};
use bzip2::read::BzDecoder;
use flate2::bufread::GzDecoder;
use proxmox_apt::deb822::CompressionType;
use proxmox_apt::{
    deb822::{CheckSums, FileReference, FileReferenceType, PackagesFile, ReleaseFile, SourcesFile},
    repositories::{APTRepository, APTRepositoryFile, APTRepositoryFileType},
};
use xz2::read::XzDecoder;

use crate::types::{Artifact, Repository, Stage};

/// Parse a single `deb`/`deb-src` line (sources.list format) into an
/// `APTRepository`.
pub fn parse_repo_line(line: &str) -> Result<APTRepository, Error> {
    let mut file = APTRepositoryFile::with_content(line.to_string(), APTRepositoryFileType::List);
    file.parse()?;
    file.repositories
        .into_iter()
        .next()
        .ok_or_else(|| format_err!("line did not parse into a repository: {line}"))
}

/// Parse a `Release`/`InRelease` file's bytes.
pub fn parse_release(data: &[u8]) -> Result<ReleaseFile, Error> {
    data.try_into()
        .map_err(|err| format_err!("invalid Release file: {err}"))
}

/// Parse a `Packages` index's (decompressed) bytes.
pub fn parse_packages(data: &[u8]) -> Result<PackagesFile, Error> {
    data.try_into()
        .map_err(|err| format_err!("invalid Packages file: {err}"))
}

/// Parse a `Sources` index's (decompressed) bytes.
pub fn parse_sources(data: &[u8]) -> Result<SourcesFile, Error> {
    data.try_into()
        .map_err(|err| format_err!("invalid Sources file: {err}"))
}

/// Whether this repository carries binary (`deb`) or source (`deb-src`)
/// packages, as configured by the `deb`/`deb-src` line keyword.
fn wants_binary(repo: &Repository) -> bool {
    !repo.source
}

fn wants_source(repo: &Repository) -> bool {
    repo.source
}

/// Every index reference (`Packages`, `Sources`, and their compressed
/// variants) a repository wants out of a parsed Release file.
///
/// All compression variants of a wanted index are kept, not just the
/// preferred one - Debian clients expect `Packages.gz` etc. to exist on
/// disk alongside `Packages`, independent of which one this engine itself
/// decompresses to build the archive stage's wanted set.
///
/// Component A ([`crate::planner::candidate_paths`]) enumerates every
/// concretely-named index path this repository could want from its
/// configuration alone, before any Release file exists; this is component
/// B's half of spec.md §4.A - it filters Release's own listing down to the
/// paths the planner actually predicted; anything Release lists that the
/// planner didn't (a component/arch this repository never asked for, or an
/// unsupported index type) is dropped. Translation files are the one
/// open-ended case: the planner can't enumerate every language code ahead
/// of time, so any `i18n/Translation-*` Release lists for a wanted
/// component is kept regardless of language.
pub fn wanted_index_references<'r>(
    release: &'r ReleaseFile,
    repo: &Repository,
) -> Vec<&'r FileReference> {
    let binary = wants_binary(repo);
    let source = wants_source(repo);
    let suite = repo.suite().unwrap_or_default();
    let candidates: std::collections::HashSet<String> =
        crate::planner::candidate_paths(repo).into_iter().collect();

    let mut wanted = Vec::new();
    for references in release.files.values() {
        for reference in references {
            if !repo.repository.components.contains(&reference.component) {
                continue;
            }

            let full_path = format!("dists/{suite}/{}", reference.path);
            let keep = match &reference.file_type {
                FileReferenceType::Ignored => false,
                FileReferenceType::PDiff => false,
                FileReferenceType::Sources(_) => source && candidates.contains(&full_path),
                _ if reference.path.contains("/i18n/") => binary,
                _ => binary && candidates.contains(&full_path),
            };

            if keep {
                wanted.push(reference);
            }
        }
    }

    wanted
}

/// Group a flat reference list by component, basename -> references, as the
/// download scheduler needs them to know which variants cover the same
/// logical index.
pub fn group_by_basename<'r>(
    references: &[&'r FileReference],
) -> HashMap<&'r str, Vec<&'r FileReference>> {
    let mut grouped: HashMap<&str, Vec<&FileReference>> = HashMap::new();
    for reference in references {
        grouped
            .entry(basename_of(&reference.path))
            .or_default()
            .push(reference);
    }
    grouped
}

/// Strip a known compression suffix (`.gz`, `.bz2`, `.xz`, `.lzma`) to group
/// `Packages`, `Packages.gz`, `Packages.xz` under one logical name.
fn basename_of(path: &str) -> &str {
    for suffix in [".gz", ".bz2", ".xz", ".lzma"] {
        if let Some(stripped) = path.strip_suffix(suffix) {
            return stripped;
        }
    }
    path
}

/// Turn a parsed `Packages` index into archive-stage artifacts.
pub fn package_artifacts(packages: &PackagesFile) -> Vec<Artifact> {
    packages
        .files
        .iter()
        .map(|entry| Artifact {
            relative_path: entry.file.clone(),
            byte_size: Some(entry.size as u64),
            checksums: entry.checksums.clone(),
            stage: Stage::Archive,
        })
        .collect()
}

/// Turn a parsed `Sources` index into archive-stage artifacts (one per file
/// referenced by each source package's `.dsc`).
pub fn source_artifacts(sources: &SourcesFile) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    for package in &sources.source_packages {
        for file_ref in package.files.values() {
            artifacts.push(Artifact {
                relative_path: format!("{}/{}", package.directory, file_ref.file),
                byte_size: Some(file_ref.size as u64),
                checksums: file_ref.checksums.clone(),
                stage: Stage::Archive,
            });
        }
    }
    artifacts
}

/// Artifacts for the index-stage references themselves (every compression
/// variant of every wanted `Packages`/`Sources`/translation file).
pub fn index_artifacts(release: &ReleaseFile, repo: &Repository) -> Vec<Artifact> {
    wanted_index_references(release, repo)
        .into_iter()
        .map(|reference| Artifact {
            relative_path: format!("dists/{}/{}", repo.suite().unwrap_or_default(), reference.path),
            byte_size: Some(reference.size as u64),
            checksums: reference.checksums.clone(),
            stage: Stage::Index,
        })
        .collect()
}

/// Decompress `data` fetched for `reference` according to its compression
/// suffix (`.gz`/`.bz2`/`.xz`/`.lzma`), or return it unchanged if the
/// reference names an already-plain file.
pub fn decompress(reference: &FileReference, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match reference.file_type.compression() {
        Some(CompressionType::Gzip) => {
            GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Some(CompressionType::Bzip2) => {
            BzDecoder::new(data).read_to_end(&mut out)?;
        }
        Some(CompressionType::Lzma) | Some(CompressionType::Xz) => {
            XzDecoder::new_multi_decoder(data).read_to_end(&mut out)?;
        }
        None => return Ok(data.to_vec()),
    }
    Ok(out)
}

/// Pick, for each logical index (grouped by [`group_by_basename`]), the
/// single reference this process should parse to derive archive artifacts -
/// the uncompressed variant when the repository carries one, else the first
/// compressed variant (decompressed via [`decompress`]).
pub fn pick_parseable_variant<'r>(references: &[&'r FileReference]) -> &'r FileReference {
    references
        .iter()
        .find(|reference| reference.file_type.compression().is_none())
        .copied()
        .unwrap_or(references[0])
}

/// `true` if every algorithm present in `checksums` agrees on the object's
/// byte size - spec.md §4.B's "consistent size across algorithms" invariant.
/// `proxmox_apt`'s deb822 parser already enforces one size per reference, so
/// this only guards hand-built `CheckSums` values (e.g. in tests).
pub fn verify_checksums(checksums: &CheckSums, data: &[u8]) -> Result<(), Error> {
    checksums.verify(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_deb_line() {
        let repo = parse_repo_line("deb http://deb.debian.org/debian noble main contrib").unwrap();
        assert_eq!(repo.uris, vec!["http://deb.debian.org/debian".to_string()]);
        assert_eq!(repo.suites, vec!["noble".to_string()]);
        assert_eq!(repo.components, vec!["main".to_string(), "contrib".to_string()]);
    }

    #[test]
    fn basename_groups_compressed_variants_together() {
        assert_eq!(basename_of("main/binary-amd64/Packages.gz"), "main/binary-amd64/Packages");
        assert_eq!(basename_of("main/binary-amd64/Packages.xz"), "main/binary-amd64/Packages");
        assert_eq!(basename_of("main/binary-amd64/Packages"), "main/binary-amd64/Packages");
    }

    fn repo(components: &[&str], arches: &[&str], source: bool) -> Repository {
        let keyword = if source { "deb-src" } else { "deb" };
        let line = format!(
            "{keyword} http://deb.debian.org/debian noble {}",
            components.join(" ")
        );
        Repository {
            repository: parse_repo_line(&line).unwrap(),
            architectures: arches.iter().map(|a| a.to_string()).collect(),
            source,
            signed_by: None,
        }
    }

    /// Component B's filtering is bounded by component A's candidate paths
    /// (spec.md §4.A): `binary-all` is always a candidate alongside the
    /// repository's configured architecture, even though only `amd64` was
    /// requested.
    #[test]
    fn wanted_index_references_keeps_binary_all_alongside_the_requested_arch() {
        let repo = repo(&["main"], &["amd64"], false);
        let release_text =
            "Suite: noble\nComponents: main\nArchitectures: amd64\nMD5Sum:\n \
             d41d8cd98f00b204e9800998ecf8427e  0 main/binary-amd64/Packages\n \
             d41d8cd98f00b204e9800998ecf8427e  0 main/binary-all/Packages\n"
                .to_string();
        let release = parse_release(release_text.as_bytes()).unwrap();

        let wanted = wanted_index_references(&release, &repo);
        assert_eq!(wanted.len(), 2);
    }

    /// A component this repository never configured must never show up in
    /// the wanted set, even if the Release file happens to list it.
    #[test]
    fn wanted_index_references_drops_an_unconfigured_component() {
        let repo = repo(&["main"], &["amd64"], false);
        let release_text =
            "Suite: noble\nComponents: main contrib\nArchitectures: amd64\nMD5Sum:\n \
             d41d8cd98f00b204e9800998ecf8427e  0 main/binary-amd64/Packages\n \
             d41d8cd98f00b204e9800998ecf8427e  0 contrib/binary-amd64/Packages\n"
                .to_string();
        let release = parse_release(release_text.as_bytes()).unwrap();

        let wanted = wanted_index_references(&release, &repo);
        assert_eq!(wanted.len(), 1);
        assert_eq!(wanted[0].component, "main");
    }

    #[test]
    fn decompress_gzip_round_trips_an_indexed_packages_file() {
        use std::io::Write;
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"Package: foo\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let release_text = format!(
            "Suite: noble\n\
             Components: main\n\
             Architectures: amd64\n\
             MD5Sum:\n \
             {}  {} main/binary-amd64/Packages.gz\n",
            md5_hex(&compressed),
            compressed.len(),
        );
        let release = parse_release(release_text.as_bytes()).unwrap();
        let reference = release.files.values().flatten().next().unwrap();

        let decompressed = decompress(reference, &compressed).unwrap();
        assert_eq!(decompressed, b"Package: foo\n");
    }

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(openssl::hash::hash(openssl::hash::MessageDigest::md5(), data).unwrap())
    }
}
