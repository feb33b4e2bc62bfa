use crate::{aggregate::DesiredBindings, identity::identity};
use binding_controller_k8s_api::{BoundEndpoint, ResourceExt};
use std::collections::BTreeSet;

/// The changes needed to move the cluster's BoundEndpoints to the desired set.
#[derive(Debug, Default, PartialEq)]
pub struct Actions {
    pub create: Vec<BoundEndpoint>,
    pub update: Vec<Update>,
    pub delete: Vec<BoundEndpoint>,
}

/// An existing BoundEndpoint paired with the desired state it should take.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub existing: BoundEndpoint,
    pub desired: BoundEndpoint,
}

/// Computes create, update and delete sets from the existing BoundEndpoints
/// and the desired map.
///
/// Every existing record lands in exactly one of `update` or `delete` and
/// every desired record in exactly one of `update` or `create`. A record whose
/// name no longer matches the identity of its URI is replaced (deleted and
/// recreated) rather than updated. The desired map is drained.
pub fn diff(existing: Vec<BoundEndpoint>, desired: &mut DesiredBindings) -> Actions {
    let mut actions = Actions::default();
    let mut matched = BTreeSet::new();

    for binding in existing {
        let uri = binding.spec.endpoint_uri.clone();
        let want = match desired.get(&uri) {
            Some(want) if !matched.contains(&uri) => want,
            // Either the tuple is gone or another record already claimed it.
            _ => {
                actions.delete.push(binding);
                continue;
            }
        };
        matched.insert(uri.clone());

        if identity(&want.spec.endpoint_uri) == binding.name_any() {
            actions.update.push(Update {
                existing: binding,
                desired: want.clone(),
            });
        } else {
            actions.delete.push(binding);
            actions.create.push(want.clone());
        }
    }

    for uri in &matched {
        desired.remove(uri);
    }
    actions
        .create
        .extend(std::mem::take(desired).into_values());

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate, RemoteEndpoint};

    fn desired(urls: &[(&str, &str)]) -> DesiredBindings {
        let eps = urls
            .iter()
            .map(|(id, url)| RemoteEndpoint {
                id: id.to_string(),
                uri: format!("/endpoints/{id}"),
                proto: String::new(),
                public_url: url.to_string(),
            })
            .collect::<Vec<_>>();
        aggregate(&eps).unwrap()
    }

    /// Simulates a BoundEndpoint that was created in an earlier pass.
    fn existing(url: &str, port: u16) -> BoundEndpoint {
        let mut binding = desired(&[("ep_x", url)]).into_values().next().unwrap();
        binding.metadata.namespace = Some("binding-system".to_string());
        binding.spec.port = port;
        binding
    }

    fn names(bindings: &[BoundEndpoint]) -> Vec<String> {
        bindings.iter().map(|b| b.spec.endpoint_uri.clone()).collect()
    }

    #[test]
    fn create_update_delete() {
        let mut want = desired(&[("ep_1", "a.x"), ("ep_2", "b.y")]);
        let actions = diff(
            vec![existing("a.x", 10000), existing("c.z", 10001)],
            &mut want,
        );

        assert_eq!(names(&actions.create), vec!["https://b.y:443"]);
        assert_eq!(actions.update.len(), 1);
        assert_eq!(actions.update[0].existing.spec.port, 10000);
        assert_eq!(
            actions.update[0].desired.spec.endpoint_uri,
            "https://a.x:443"
        );
        assert_eq!(names(&actions.delete), vec!["https://c.z:443"]);
        assert!(want.is_empty(), "desired map must be drained");
    }

    #[test]
    fn identity_change_replaces() {
        let mut stale = existing("a.x", 10000);
        stale.metadata.name = Some("ep-legacy-name".to_string());

        let mut want = desired(&[("ep_1", "a.x")]);
        let actions = diff(vec![stale], &mut want);

        assert!(actions.update.is_empty());
        assert_eq!(actions.delete.len(), 1);
        assert_eq!(actions.delete[0].name_any(), "ep-legacy-name");
        assert_eq!(names(&actions.create), vec!["https://a.x:443"]);
        assert_eq!(
            actions.create[0].name_any(),
            identity("https://a.x:443")
        );
    }

    #[test]
    fn duplicate_existing_records() {
        let mut want = desired(&[("ep_1", "a.x")]);
        let actions = diff(
            vec![existing("a.x", 10000), existing("a.x", 10001)],
            &mut want,
        );
        assert_eq!(actions.update.len(), 1);
        assert_eq!(actions.update[0].existing.spec.port, 10000);
        assert_eq!(actions.delete.len(), 1);
        assert_eq!(actions.delete[0].spec.port, 10001);
        assert!(actions.create.is_empty());
    }

    #[test]
    fn totality() {
        let cases: Vec<(Vec<&str>, Vec<&str>)> = vec![
            (vec![], vec![]),
            (vec!["a.x"], vec![]),
            (vec![], vec!["a.x"]),
            (vec!["a.x", "b.y", "c.z"], vec!["b.y", "d.w"]),
            (vec!["a.x", "a.x"], vec!["a.x", "b.y"]),
        ];

        for (have, want) in cases {
            let have_bindings = have
                .iter()
                .enumerate()
                .map(|(i, url)| existing(url, 10000 + i as u16))
                .collect::<Vec<_>>();
            let mut want_bindings = desired(
                &want
                    .iter()
                    .enumerate()
                    .map(|(i, url)| (["ep_a", "ep_b", "ep_c"][i], *url))
                    .collect::<Vec<_>>(),
            );
            let n_desired = want_bindings.len();

            let actions = diff(have_bindings, &mut want_bindings);

            assert_eq!(
                actions.update.len() + actions.delete.len(),
                have.len(),
                "every existing record is accounted for in {have:?} -> {want:?}"
            );
            assert_eq!(
                actions.update.len() + actions.create.len(),
                n_desired,
                "every desired record is accounted for in {have:?} -> {want:?}"
            );

            let created = names(&actions.create);
            for update in &actions.update {
                assert!(!created.contains(&update.desired.spec.endpoint_uri));
            }
        }
    }
}
