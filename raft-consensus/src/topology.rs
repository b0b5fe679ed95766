use std::collections::BTreeSet;

use crate::error::RaftError;

/// Identifier of a server in the cluster.
pub type PeerId = u64;

/// The fixed set of servers this node runs with, including itself.
///
/// Membership never changes at runtime, so quorum sizes are computed once
/// from this set.
#[derive(Debug, Clone)]
pub struct Topology {
    me: PeerId,
    members: Vec<PeerId>,
}

impl Topology {
    pub fn new(me: PeerId, members: Vec<PeerId>) -> Result<Self, RaftError> {
        if members.is_empty() {
            return Err(RaftError::Config(
                "topology requires at least one node".to_string(),
            ));
        }
        let unique: BTreeSet<PeerId> = members.iter().copied().collect();
        if unique.len() != members.len() {
            return Err(RaftError::Config(format!(
                "duplicate node ids in topology {members:?}"
            )));
        }
        if !unique.contains(&me) {
            return Err(RaftError::Config(format!(
                "node {me} is not a member of {members:?}"
            )));
        }
        Ok(Self {
            me,
            members: unique.into_iter().collect(),
        })
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    /// All members in ascending id order, self included.
    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    /// Every member except self.
    pub fn others(&self) -> impl Iterator<Item = PeerId> + '_ {
        let me = self.me;
        self.members.iter().copied().filter(move |id| *id != me)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Strict majority of the full member set.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(Topology::new(1, vec![1]).unwrap().quorum(), 1);
        assert_eq!(Topology::new(1, vec![1, 2]).unwrap().quorum(), 2);
        assert_eq!(Topology::new(1, vec![1, 2, 3]).unwrap().quorum(), 2);
        assert_eq!(Topology::new(1, vec![1, 2, 3, 4]).unwrap().quorum(), 3);
        assert_eq!(Topology::new(1, vec![1, 2, 3, 4, 5]).unwrap().quorum(), 3);
    }

    #[test]
    fn others_excludes_self() {
        let topology = Topology::new(2, vec![3, 1, 2]).unwrap();
        assert_eq!(topology.members(), &[1, 2, 3]);
        assert_eq!(topology.others().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn rejects_invalid_membership() {
        assert!(Topology::new(1, vec![]).is_err());
        assert!(Topology::new(4, vec![1, 2, 3]).is_err());
        assert!(Topology::new(1, vec![1, 2, 2]).is_err());
    }
}
