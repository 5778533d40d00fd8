// src/resolver/mod.rs

//! Dependency resolution
//!
//! Given requirements and a pool of candidates per name, find the first
//! combination (one candidate per name) that satisfies every requirement,
//! including the dependencies the chosen packages declare.
//!
//! Candidates for each name are sorted best first, so a name's depth is
//! the index of its choice. Combinations are tried by ascending total
//! depth over the requested (core) names, and for each of those by
//! ascending depth over the names pulled in as dependencies. When the
//! chosen packages introduce requirements on names not yet considered, a
//! new search frame is pushed with the extended requirement set. The
//! search is an explicit stack of frames rather than recursion.

pub mod candidate;
pub mod depth;
pub mod matcher;

use crate::error::{Error, Result};
use crate::host::HostFacts;
use crate::metadata::Requirement;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info};

pub use candidate::{Candidate, Source, preference_order};
pub use depth::{Combinations, DepthVectors};
pub use matcher::matches;

/// Maximum number of combinations examined before giving up
pub const MAX_POSSIBLE_SOLUTIONS: usize = 10_000;

/// Candidates per package name
pub type Pools = BTreeMap<String, Vec<Rc<Candidate>>>;

/// One chosen candidate per required name
pub type Solution = Vec<Candidate>;

/// Supplies candidates for names that have no pool yet
pub trait CandidateProvider {
    fn candidates(&self, req: &Requirement) -> Vec<Candidate>;
}

impl CandidateProvider for [Candidate] {
    fn candidates(&self, req: &Requirement) -> Vec<Candidate> {
        self.iter().filter(|c| c.name() == req.name).cloned().collect()
    }
}

impl CandidateProvider for Vec<Candidate> {
    fn candidates(&self, req: &Requirement) -> Vec<Candidate> {
        self.as_slice().candidates(req)
    }
}

/// Build pools from a flat candidate list
pub fn pools_from<I: IntoIterator<Item = Candidate>>(candidates: I) -> Pools {
    let mut pools = Pools::new();
    for candidate in candidates {
        pools
            .entry(candidate.name().to_string())
            .or_default()
            .push(Rc::new(candidate));
    }
    pools
}

/// A partial search state: a requirement set, its filtered pools and the
/// remaining combinations to try
struct Frame {
    requirements: Vec<Requirement>,
    pools: Pools,
    /// Core names first, then non-core, in first-seen order
    names: Vec<String>,
    /// Per-name depth offset (1 when the best candidate is not installed)
    offsets: Vec<usize>,
    combinations: Combinations,
}

pub struct Resolver<'a, P: CandidateProvider + ?Sized> {
    provider: &'a P,
    host: &'a HostFacts,
    limit: usize,
}

impl<'a, P: CandidateProvider + ?Sized> Resolver<'a, P> {
    pub fn new(provider: &'a P, host: &'a HostFacts) -> Self {
        Self {
            provider,
            host,
            limit: MAX_POSSIBLE_SOLUTIONS,
        }
    }

    /// Override the combination ceiling
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Resolve `requirements` starting from `pools`
    ///
    /// `core` names the packages explicitly requested by the caller. Pools
    /// are consumed; callers wanting to reuse them must clone first.
    pub fn resolve(&self, requirements: &[Requirement], pools: Pools, core: &[String]) -> Result<Solution> {
        let root = self
            .frame(requirements.to_vec(), pools, core)
            .map_err(|req| Error::NoSolution(format!("no package satisfies {}", req)))?;

        let mut stack = vec![root];
        let mut checked = 0usize;
        let mut last_unsatisfied: Option<Requirement> = None;

        while let Some(frame) = stack.last_mut() {
            let Some(depths) = frame.combinations.next() else {
                stack.pop();
                continue;
            };

            checked += 1;
            if checked > self.limit {
                return Err(Error::SearchLimitExceeded(self.limit));
            }

            let chosen: Vec<Rc<Candidate>> = depths
                .iter()
                .zip(&frame.offsets)
                .zip(&frame.names)
                .map(|((depth, offset), name)| Rc::clone(&frame.pools[name][depth - offset]))
                .collect();

            match self.check(frame, &chosen) {
                Check::Invalid => continue,
                Check::Solved => {
                    info!("Resolved {} package(s) after {} combination(s)", chosen.len(), checked);
                    return Ok(chosen.iter().map(|c| (**c).clone()).collect());
                }
                Check::Expand(new_requirements) => {
                    let mut requirements = frame.requirements.clone();
                    requirements.extend(new_requirements);
                    let pools = frame.pools.clone();
                    debug!(
                        "Expanding search to {} requirement(s) at depth {}",
                        requirements.len(),
                        stack.len()
                    );
                    match self.frame(requirements, pools, core) {
                        Ok(child) => stack.push(child),
                        Err(req) => {
                            debug!("No candidates for {}", req);
                            last_unsatisfied = Some(req);
                        }
                    }
                }
            }
        }

        let detail = match last_unsatisfied {
            Some(req) => format!(
                "no consistent set of packages for {}; no candidate satisfies dependency {}",
                describe(requirements),
                req
            ),
            None => format!("no consistent set of packages for {}", describe(requirements)),
        };
        Err(Error::NoSolution(detail))
    }

    /// Populate, filter and sort pools for a requirement set
    ///
    /// Fails with the first requirement whose pool ends up empty.
    fn frame(
        &self,
        requirements: Vec<Requirement>,
        mut pools: Pools,
        core: &[String],
    ) -> std::result::Result<Frame, Requirement> {
        let mut names: Vec<String> = Vec::new();

        for req in &requirements {
            let pool = pools.entry(req.name.clone()).or_insert_with(|| {
                self.provider
                    .candidates(req)
                    .into_iter()
                    .map(Rc::new)
                    .collect()
            });
            pool.retain(|c| matches(c, req, self.host));
            if pool.is_empty() {
                return Err(req.clone());
            }
            if !names.contains(&req.name) {
                names.push(req.name.clone());
            }
        }

        for name in &names {
            if let Some(pool) = pools.get_mut(name) {
                pool.sort_by(|a, b| preference_order(a, b));
            }
        }

        let (core_names, noncore_names): (Vec<String>, Vec<String>) =
            names.into_iter().partition(|n| core.contains(n));

        let bounds = |names: &[String]| -> Vec<(usize, usize)> {
            names
                .iter()
                .map(|name| {
                    let pool = &pools[name];
                    let offset = usize::from(!pool[0].is_installed());
                    (offset, pool.len() - 1 + offset)
                })
                .collect()
        };
        let core_bounds = bounds(&core_names);
        let noncore_bounds = bounds(&noncore_names);

        let offsets = core_bounds
            .iter()
            .chain(noncore_bounds.iter())
            .map(|(low, _)| *low)
            .collect();

        let mut names = core_names;
        names.extend(noncore_names);

        Ok(Frame {
            requirements,
            pools,
            names,
            offsets,
            combinations: Combinations::new(core_bounds, noncore_bounds),
        })
    }

    /// Judge one combination against the dependencies it declares
    fn check(&self, frame: &Frame, chosen: &[Rc<Candidate>]) -> Check {
        let mut new_requirements: Vec<Requirement> = Vec::new();
        for pkg in chosen {
            for dep in pkg.metadata.dependency_requirements() {
                if !frame.requirements.contains(&dep) && !new_requirements.contains(&dep) {
                    new_requirements.push(dep);
                }
            }
        }

        if new_requirements.is_empty() {
            return Check::Solved;
        }

        let mut expand = false;
        for req in &new_requirements {
            match chosen.iter().find(|c| c.name() == req.name) {
                Some(pkg) if !matches(pkg, req, self.host) => return Check::Invalid,
                Some(_) => {}
                None => expand = true,
            }
        }

        if expand {
            Check::Expand(new_requirements)
        } else {
            Check::Solved
        }
    }
}

enum Check {
    Invalid,
    Solved,
    Expand(Vec<Requirement>),
}

fn describe(requirements: &[Requirement]) -> String {
    requirements
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    fn host() -> HostFacts {
        HostFacts::new("RedHat-5", "x86_64")
    }

    fn remote(name: &str, version: &str) -> Candidate {
        Candidate::new(
            Metadata::new(name, version, "me"),
            Source::Remote(format!("http://repo/{}-{}.tpkg", name, version)),
        )
    }

    fn dep(name: &str, min: Option<&str>, max: Option<&str>) -> Requirement {
        let mut req = Requirement::named(name);
        req.minimum_version = min.map(String::from);
        req.maximum_version = max.map(String::from);
        req
    }

    fn names(solution: &Solution) -> Vec<String> {
        let mut names: Vec<String> = solution
            .iter()
            .map(|c| format!("{}-{}", c.name(), c.metadata.version))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_single_package_picks_newest() {
        let available = vec![remote("a", "1.0"), remote("a", "2.0")];
        let host = HostFacts::new("Linux", "x86_64");
        let resolver = Resolver::new(&available, &host);
        let solution = resolver
            .resolve(&[Requirement::named("a")], Pools::new(), &["a".to_string()])
            .unwrap();
        assert_eq!(names(&solution), vec!["a-2.0"]);
    }

    #[test]
    fn test_missing_package_is_no_solution() {
        let available: Vec<Candidate> = vec![];
        let host = host();
        let resolver = Resolver::new(&available, &host);
        let err = resolver
            .resolve(&[Requirement::named("ghost")], Pools::new(), &["ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::NoSolution(_)));
    }

    #[test]
    fn test_transitive_dependency_resolution() {
        let mut a = remote("a", "1.0");
        a.metadata.dependencies = vec![dep("b", Some("2.0"), None)];
        let available = vec![a, remote("b", "1.0"), remote("b", "2.5")];

        let host = host();
        let resolver = Resolver::new(&available, &host);
        let solution = resolver
            .resolve(&[Requirement::named("a")], Pools::new(), &["a".to_string()])
            .unwrap();
        assert_eq!(names(&solution), vec!["a-1.0", "b-2.5"]);
    }

    #[test]
    fn test_backtracks_to_older_core_package() {
        // a-2.0 needs an impossible c, a-1.0 does not
        let mut a2 = remote("a", "2.0");
        a2.metadata.dependencies = vec![dep("c", Some("9.0"), None)];
        let a1 = remote("a", "1.0");
        let available = vec![a1, a2, remote("c", "1.0")];

        let host = host();
        let resolver = Resolver::new(&available, &host);
        let solution = resolver
            .resolve(&[Requirement::named("a")], Pools::new(), &["a".to_string()])
            .unwrap();
        assert_eq!(names(&solution), vec!["a-1.0"]);
    }

    #[test]
    fn test_chosen_package_must_satisfy_later_dependency() {
        // b is requested directly; a needs b < 2, so b-2.0 must be given up
        let mut a = remote("a", "1.0");
        a.metadata.dependencies = vec![dep("b", None, Some("1.9"))];
        let available = vec![a, remote("b", "1.0"), remote("b", "2.0")];

        let host = host();
        let resolver = Resolver::new(&available, &host);
        let core = vec!["a".to_string(), "b".to_string()];
        let solution = resolver
            .resolve(&[Requirement::named("a"), Requirement::named("b")], Pools::new(), &core)
            .unwrap();
        assert_eq!(names(&solution), vec!["a-1.0", "b-1.0"]);
    }

    #[test]
    fn test_installed_preferred_over_newer() {
        let installed = Candidate::new(Metadata::new("a", "1.0", "me"), Source::Installed).preferred(true);
        let available = vec![installed, remote("a", "2.0")];

        let host = host();
        let resolver = Resolver::new(&available, &host);
        let solution = resolver
            .resolve(&[Requirement::named("a")], Pools::new(), &["a".to_string()])
            .unwrap();
        assert!(solution[0].is_installed());
        assert_eq!(solution[0].metadata.version, "1.0");
    }

    #[test]
    fn test_seed_pool_is_used_before_provider() {
        let available = vec![remote("a", "3.0")];
        let pools = pools_from(vec![remote("a", "1.0")]);

        let host = host();
        let resolver = Resolver::new(&available, &host);
        let solution = resolver
            .resolve(&[Requirement::named("a")], pools, &["a".to_string()])
            .unwrap();
        assert_eq!(solution[0].metadata.version, "1.0");
    }

    #[test]
    fn test_search_limit() {
        // Every a depends on a b that does not exist
        let mut available = Vec::new();
        for i in 0..20 {
            let mut a = remote("a", &format!("1.{}", i));
            a.metadata.dependencies = vec![dep("b", Some("5.0"), None)];
            available.push(a);
        }
        available.push(remote("b", "1.0"));

        let host = host();
        let resolver = Resolver::new(&available, &host).with_limit(5);
        let err = resolver
            .resolve(&[Requirement::named("a")], Pools::new(), &["a".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::SearchLimitExceeded(5)));
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let mut a = remote("a", "1.0");
        a.metadata.dependencies = vec![Requirement::named("b")];
        let mut b = remote("b", "1.0");
        b.metadata.dependencies = vec![Requirement::named("a")];
        let available = vec![a, b];

        let host = host();
        let resolver = Resolver::new(&available, &host);
        let solution = resolver
            .resolve(&[Requirement::named("a")], Pools::new(), &["a".to_string()])
            .unwrap();
        assert_eq!(names(&solution), vec!["a-1.0", "b-1.0"]);
    }
}
