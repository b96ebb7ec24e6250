//! Deterministic rewriting of a requested pip package list into the canonical form that
//! feeds the cache key, so that two requests differing only in irrelevant detail (a
//! Debian packaging artifact, a GPU/CPU distinction the caller shouldn't have to know
//! about) hash to the same virtualenv.

/// Strip `pkg-resources*` (a spurious entry Debian's system Python injects into `pip
/// list`) and, when a GPU is allocated, rewrite `tensorflow`/`tensorflow==X` requests to
/// `tensorflow_gpu`/`tensorflow_gpu==X`.
pub fn groom_pip_list(packages: &[String], gpu: bool) -> Vec<String> {
    packages
        .iter()
        .filter(|pkg| !pkg.starts_with("pkg-resources"))
        .map(|pkg| if gpu { rewrite_tensorflow(pkg) } else { pkg.clone() })
        .collect()
}

fn rewrite_tensorflow(pkg: &str) -> String {
    match pkg.split_once("==") {
        Some(("tensorflow", version)) => format!("tensorflow_gpu=={version}"),
        _ if pkg == "tensorflow" => "tensorflow_gpu".to_string(),
        _ => pkg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_pkg_resources_entries() {
        let groomed = groom_pip_list(
            &["pkg-resources==0.0.0".to_string(), "requests".to_string()],
            false,
        );
        assert_eq!(groomed, vec!["requests".to_string()]);
    }

    #[test]
    fn rewrites_tensorflow_to_gpu_variant_only_when_gpu_allocated() {
        let packages = vec!["tensorflow==2.4.0".to_string()];
        assert_eq!(groom_pip_list(&packages, false), packages);
        assert_eq!(
            groom_pip_list(&packages, true),
            vec!["tensorflow_gpu==2.4.0".to_string()]
        );
    }

    #[test]
    fn rewrites_unpinned_tensorflow() {
        let packages = vec!["tensorflow".to_string()];
        assert_eq!(groom_pip_list(&packages, true), vec!["tensorflow_gpu".to_string()]);
    }

    #[test]
    fn leaves_unrelated_packages_untouched_under_gpu() {
        let packages = vec!["numpy==1.26.0".to_string()];
        assert_eq!(groom_pip_list(&packages, true), packages);
    }
}
