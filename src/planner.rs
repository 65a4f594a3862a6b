//! Path planner (component A): enumerates the *candidate* metadata object
//! paths for a repository from its configured components/architectures
//! alone, before any Release file has been fetched. [`metadata`](crate::metadata)
//! intersects this candidate set against what the Release file actually
//! lists - the planner itself never talks to the network.

use crate::types::Repository;

/// Translation languages mirrored by default; `Translation-en` is the one
/// every client expects, the rest follow the set Debian/Ubuntu ship.
const TRANSLATIONS: &[&str] = &["en"];

/// Every `dists/<suite>/...` path this repository might need, before
/// filtering against what Release actually declares.
pub fn candidate_paths(repo: &Repository) -> Vec<String> {
    let Ok(suite) = repo.suite() else {
        return Vec::new();
    };

    let mut paths = vec![
        format!("dists/{suite}/InRelease"),
        format!("dists/{suite}/Release"),
        format!("dists/{suite}/Release.gpg"),
    ];

    let mut arches: Vec<&str> = repo.architectures.iter().map(String::as_str).collect();
    if !arches.contains(&"all") {
        arches.push("all");
    }

    for component in &repo.repository.components {
        for arch in &arches {
            paths.push(format!("dists/{suite}/{component}/binary-{arch}/Packages"));
            paths.push(format!("dists/{suite}/{component}/binary-{arch}/Packages.gz"));
            paths.push(format!("dists/{suite}/{component}/binary-{arch}/Packages.xz"));
            paths.push(format!("dists/{suite}/{component}/binary-{arch}/Packages.bz2"));
            paths.push(format!("dists/{suite}/{component}/Contents-{arch}"));
            paths.push(format!("dists/{suite}/{component}/Contents-{arch}.gz"));
        }
        for lang in TRANSLATIONS {
            paths.push(format!("dists/{suite}/{component}/i18n/Translation-{lang}"));
        }
        if repo.source {
            paths.push(format!("dists/{suite}/{component}/source/Sources"));
            paths.push(format!("dists/{suite}/{component}/source/Sources.gz"));
            paths.push(format!("dists/{suite}/{component}/source/Sources.xz"));
            paths.push(format!("dists/{suite}/{component}/source/Sources.bz2"));
        }
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(components: &[&str], arches: &[&str], source: bool) -> Repository {
        let keyword = if source { "deb-src" } else { "deb" };
        let line = format!(
            "{keyword} http://deb.debian.org/debian noble {}",
            components.join(" ")
        );
        let repository = crate::metadata::parse_repo_line(&line).unwrap();
        Repository {
            repository,
            architectures: arches.iter().map(|a| a.to_string()).collect(),
            source,
            signed_by: None,
        }
    }

    #[test]
    fn candidate_paths_cover_binary_all_and_requested_arch() {
        let repo = repo(&["main"], &["amd64"], false);
        let paths = candidate_paths(&repo);
        assert!(paths.contains(&"dists/noble/main/binary-amd64/Packages.xz".to_string()));
        assert!(paths.contains(&"dists/noble/main/binary-all/Packages".to_string()));
        assert!(!paths.iter().any(|p| p.contains("source/Sources")));
    }

    #[test]
    fn candidate_paths_include_sources_when_mirroring_source() {
        let repo = repo(&["main"], &["amd64"], true);
        let paths = candidate_paths(&repo);
        assert!(paths.contains(&"dists/noble/main/source/Sources.xz".to_string()));
    }

    #[test]
    fn candidate_paths_cover_every_configured_component() {
        let repo = repo(&["main", "contrib"], &["amd64"], false);
        let paths = candidate_paths(&repo);
        assert!(paths.iter().any(|p| p.starts_with("dists/noble/main/")));
        assert!(paths.iter().any(|p| p.starts_with("dists/noble/contrib/")));
    }
}
