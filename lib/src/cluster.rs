// Copyright 2025 The Chert Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cluster construction.
//!
//! A cluster is an artifact whose M cards list other artifacts. Servers
//! periodically pack the unclustered public set into clusters; a peer that
//! acknowledges a cluster implicitly acknowledges knowing about its
//! members, which keeps the per-sync `igot` traffic proportional to new
//! work instead of repository size.

use rusqlite::params;
use tracing::debug;

use crate::manifest::Manifest;
use crate::object_id::ArtifactId;
use crate::repo::RepoError;
use crate::repo::Repository;
use crate::repo::Rid;
use crate::xref;
use crate::xref::ModerationPolicy;

/// Clusters smaller than this are not worth writing.
const MIN_CLUSTER_SIZE: usize = 2;

/// Members per cluster artifact.
const MAX_CLUSTER_SIZE: usize = 100;

impl Repository {
    /// Packs the public unclustered artifacts into cluster artifacts.
    /// Returns the rids of the clusters created.
    pub fn cluster_make(&self) -> Result<Vec<Rid>, RepoError> {
        let members: Vec<String> = {
            let mut stmt = self.db().prepare_cached(
                "SELECT blob.uuid FROM unclustered JOIN blob USING(rid)
                  WHERE blob.size>=0
                    AND blob.rid NOT IN private
                    AND blob.uuid NOT IN shun
                  ORDER BY blob.uuid",
            )?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        if members.len() < MIN_CLUSTER_SIZE {
            return Ok(Vec::new());
        }
        let mut created = Vec::new();
        for chunk in members.chunks(MAX_CLUSTER_SIZE) {
            if chunk.len() < MIN_CLUSTER_SIZE {
                break;
            }
            let m = Manifest {
                members: chunk
                    .iter()
                    .map(|u| ArtifactId::parse(u).expect("stored names are valid"))
                    .collect(),
                has_z_card: true,
                ..Manifest::default()
            };
            let text = m.emit();
            let (rid, _) = self.content_put(&text)?;
            // Crosslinking tags the cluster and clears its members from
            // the unclustered set.
            xref::manifest_crosslink(self, rid, &ModerationPolicy::TRUSTED)?;
            debug!(rid, members = chunk.len(), "cluster created");
            created.push(rid);
        }
        Ok(created)
    }

    /// The uuids of all cluster artifacts, ascending.
    pub fn cluster_uuids(&self) -> Result<Vec<String>, RepoError> {
        let mut stmt = self.db().prepare_cached(
            "SELECT blob.uuid FROM tagxref JOIN blob ON blob.rid=tagxref.rid
              WHERE tagxref.tagid=?1 AND tagxref.tagtype>0
              ORDER BY blob.uuid",
        )?;
        let uuids = stmt
            .query_map(params![crate::schema::tagid::CLUSTER], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(uuids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_drains_unclustered() {
        let repo = Repository::create_in_memory().unwrap();
        repo.begin_transaction().unwrap();
        for i in 0..5u32 {
            repo.content_put(format!("artifact number {i}\n").as_bytes())
                .unwrap();
        }
        let clusters = repo.cluster_make().unwrap();
        repo.end_transaction(true).unwrap();
        assert_eq!(clusters.len(), 1);
        // Only the cluster itself remains unclustered.
        let n: i64 = repo
            .db()
            .query_row("SELECT count(*) FROM unclustered", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(repo.cluster_uuids().unwrap().len(), 1);
    }
}
