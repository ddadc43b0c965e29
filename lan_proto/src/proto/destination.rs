use itertools::Itertools;
use lan_types::proto::HostId;

/// Where a message goes. A host id is classified once, under the registry lock, and groups are
/// expanded into their members
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Destination {
    /// This node. Delivered through the task queue without touching a socket
    Local,
    Server,
    Peer(HostId),
    Group(HostId),
}

impl Destination {
    /// Flattens `targets` into the individual hosts a message must reach. `classify` maps an id
    /// to its kind (`None` for ids nobody owns); `members` lists a group. Each host appears
    /// once, in first-seen order; unknown ids are returned separately
    pub fn expand(
        targets: &[HostId],
        classify: impl Fn(HostId) -> Option<Destination>,
        members: impl Fn(HostId) -> Vec<HostId>,
    ) -> (Vec<Destination>, Vec<HostId>) {
        let mut resolved = Vec::new();
        let mut unknown = Vec::new();

        for target in targets {
            match classify(*target) {
                Some(Destination::Group(group_id)) => {
                    for member in members(group_id) {
                        match classify(member) {
                            Some(Destination::Group(_)) | None => unknown.push(member),
                            Some(destination) => resolved.push(destination),
                        }
                    }
                }
                Some(destination) => resolved.push(destination),
                None => unknown.push(*target),
            }
        }

        (
            resolved.into_iter().unique().collect(),
            unknown.into_iter().unique().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: HostId = HostId(2);
    const PEER: HostId = HostId(3);
    const OTHER: HostId = HostId(4);
    const GROUP: HostId = HostId(10);

    fn classify(id: HostId) -> Option<Destination> {
        match id {
            HostId::SERVER => Some(Destination::Server),
            ME => Some(Destination::Local),
            PEER | OTHER => Some(Destination::Peer(id)),
            GROUP => Some(Destination::Group(id)),
            _ => None,
        }
    }

    #[test]
    fn groups_expand_and_duplicates_collapse() {
        let (resolved, unknown) = Destination::expand(
            &[PEER, GROUP, HostId::SERVER, PEER, HostId(99)],
            classify,
            |_| vec![ME, PEER, OTHER],
        );
        assert_eq!(
            resolved,
            vec![
                Destination::Peer(PEER),
                Destination::Local,
                Destination::Peer(OTHER),
                Destination::Server
            ]
        );
        assert_eq!(unknown, vec![HostId(99)]);
    }
}
