//! Region/zone-grouped site registry with fair iteration order
//!
//! Sites are grouped by `region/zone` in first-insertion order; iteration
//! round-robins across zones so a consumer walking `num_sites` entries visits
//! every site once without starving any zone. The snapshot list rebuild is
//! the only consumer of [`SiteTree::next`].

use std::collections::HashMap;
use tracing::warn;

use super::CollectorError;
use crate::models::Site;

/// Sites of one zone plus the round-robin cursor
#[derive(Debug, Default)]
struct ZoneSites {
    sites: Vec<String>,
    last_index: usize,
}

impl ZoneSites {
    fn next(&mut self) -> Option<String> {
        if self.last_index >= self.sites.len() {
            return None;
        }
        let site = self.sites[self.last_index].clone();
        self.last_index += 1;
        Some(site)
    }
}

/// Ordered site registry used for deterministic snapshot traversal
#[derive(Debug, Default)]
pub struct SiteTree {
    zones: Vec<String>,
    tree: HashMap<String, ZoneSites>,
    zone_index: usize,
    num_sites: usize,
}

impl SiteTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_sites(&self) -> usize {
        self.num_sites
    }

    /// Register a site. Re-adding a known site is a no-op.
    pub fn add_site(&mut self, site: &Site) {
        let zone_key = site.zone_key();
        let zone = self.tree.entry(zone_key.clone()).or_insert_with(|| {
            self.zones.push(zone_key);
            ZoneSites::default()
        });
        if zone.sites.iter().any(|s| s == &site.site_id) {
            return;
        }
        zone.sites.push(site.site_id.clone());
        self.num_sites += 1;
    }

    /// Move a site between zones when its placement metadata changed
    pub fn update_site(&mut self, old: &Site, new: &Site) {
        if old.zone_key() == new.zone_key() {
            // Same zone: make sure it is present (update may arrive first).
            self.add_site(new);
            return;
        }
        if let Err(err) = self.remove_site(old) {
            warn!(site_id = %old.site_id, error = %err, "update for site not in tree");
        }
        self.add_site(new);
    }

    /// Deregister a site; empty zones are dropped from the rotation
    pub fn remove_site(&mut self, site: &Site) -> Result<(), CollectorError> {
        let zone_key = site.zone_key();
        let zone = self
            .tree
            .get_mut(&zone_key)
            .ok_or_else(|| CollectorError::SiteNotFound {
                site_id: site.site_id.clone(),
            })?;

        let position = zone
            .sites
            .iter()
            .position(|s| s == &site.site_id)
            .ok_or_else(|| CollectorError::SiteNotFound {
                site_id: site.site_id.clone(),
            })?;

        zone.sites.remove(position);
        if zone.last_index > position {
            zone.last_index -= 1;
        }
        self.num_sites -= 1;

        if zone.sites.is_empty() {
            self.tree.remove(&zone_key);
            self.zones.retain(|z| z != &zone_key);
            if self.zone_index >= self.zones.len() {
                self.zone_index = 0;
            }
        }
        Ok(())
    }

    /// Next site id in round-robin zone order. A full pass of `num_sites`
    /// calls yields every site exactly once; the cursors then wrap.
    pub fn next(&mut self) -> Option<String> {
        if self.zones.is_empty() {
            return None;
        }

        let mut exhausted_zones = 0;
        loop {
            if self.zone_index >= self.zones.len() {
                self.zone_index = 0;
            }
            let zone_key = self.zones[self.zone_index].clone();
            self.zone_index += 1;

            let zone = self.tree.get_mut(&zone_key).expect("zone list out of sync");
            if let Some(site) = zone.next() {
                return Some(site);
            }

            exhausted_zones += 1;
            if exhausted_zones >= self.zones.len() {
                self.reset_exhausted();
                exhausted_zones = 0;
            }
        }
    }

    fn reset_exhausted(&mut self) {
        for zone in self.tree.values_mut() {
            zone.last_index = 0;
        }
        self.zone_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: &str, region: &str, zone: &str) -> Site {
        Site::new(id, region, zone)
    }

    fn walk(tree: &mut SiteTree, count: usize) -> Vec<String> {
        (0..count).filter_map(|_| tree.next()).collect()
    }

    #[test]
    fn test_empty_tree() {
        let mut tree = SiteTree::new();
        assert_eq!(tree.num_sites(), 0);
        assert_eq!(tree.next(), None);
    }

    #[test]
    fn test_round_robin_across_zones() {
        let mut tree = SiteTree::new();
        tree.add_site(&site("a1", "kr", "az1"));
        tree.add_site(&site("a2", "kr", "az1"));
        tree.add_site(&site("b1", "kr", "az2"));
        tree.add_site(&site("b2", "kr", "az2"));

        // Zones alternate; within a zone, insertion order.
        assert_eq!(walk(&mut tree, 4), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_full_pass_visits_every_site_once() {
        let mut tree = SiteTree::new();
        tree.add_site(&site("a1", "kr", "az1"));
        tree.add_site(&site("a2", "kr", "az1"));
        tree.add_site(&site("a3", "kr", "az1"));
        tree.add_site(&site("b1", "us", "az1"));

        let count = tree.num_sites();
        let mut seen = walk(&mut tree, count);
        seen.sort();
        assert_eq!(seen, vec!["a1", "a2", "a3", "b1"]);

        // A second full pass wraps and again covers everything.
        let count = tree.num_sites();
        let mut seen = walk(&mut tree, count);
        seen.sort();
        assert_eq!(seen, vec!["a1", "a2", "a3", "b1"]);
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let mut tree = SiteTree::new();
        tree.add_site(&site("a1", "kr", "az1"));
        tree.add_site(&site("a1", "kr", "az1"));
        assert_eq!(tree.num_sites(), 1);
    }

    #[test]
    fn test_remove_site_and_empty_zone() {
        let mut tree = SiteTree::new();
        tree.add_site(&site("a1", "kr", "az1"));
        tree.add_site(&site("b1", "kr", "az2"));

        tree.remove_site(&site("a1", "kr", "az1")).unwrap();
        assert_eq!(tree.num_sites(), 1);
        assert_eq!(walk(&mut tree, 1), vec!["b1"]);

        let err = tree.remove_site(&site("a1", "kr", "az1")).unwrap_err();
        assert!(matches!(err, CollectorError::SiteNotFound { .. }));
    }

    #[test]
    fn test_update_site_moves_zone() {
        let mut tree = SiteTree::new();
        let old = site("a1", "kr", "az1");
        let new = site("a1", "kr", "az2");
        tree.add_site(&old);

        tree.update_site(&old, &new);
        assert_eq!(tree.num_sites(), 1);
        assert_eq!(walk(&mut tree, 1), vec!["a1"]);
    }
}
