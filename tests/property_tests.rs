use proptest::prelude::*;
use relcache::{EdgeIndex, Kind, ObjectId, Relation, UsageInfo};
use std::collections::{BTreeMap, BTreeSet};

const KINDS: [Kind; 3] = [
    Kind::from_static("A"),
    Kind::from_static("B"),
    Kind::from_static("C"),
];
const RELATIONS: [Relation; 3] = [Relation::OWNER, Relation::USES, Relation::CLAIMS];

type Model = BTreeMap<ObjectId, BTreeSet<(Relation, ObjectId)>>;

#[derive(Debug, Clone)]
enum Operation {
    Replace {
        source: ObjectId,
        edges: Vec<(Relation, ObjectId)>,
    },
    ReplaceScoped {
        source: ObjectId,
        scope: Kind,
        edges: Vec<(Relation, ObjectId)>,
    },
    Delete {
        id: ObjectId,
    },
}

fn arb_kind() -> impl Strategy<Value = Kind> {
    (0..KINDS.len()).prop_map(|i| KINDS[i].clone())
}

fn arb_id() -> impl Strategy<Value = ObjectId> {
    (arb_kind(), 0u8..4).prop_map(|(kind, n)| ObjectId::new(kind, "ns", format!("o{n}")))
}

fn arb_edges() -> impl Strategy<Value = Vec<(Relation, ObjectId)>> {
    prop::collection::vec(
        ((0..RELATIONS.len()).prop_map(|i| RELATIONS[i].clone()), arb_id()),
        0..6,
    )
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        3 => (arb_id(), arb_edges()).prop_map(|(source, edges)| Operation::Replace { source, edges }),
        2 => (arb_id(), arb_kind(), arb_edges())
            .prop_map(|(source, scope, edges)| Operation::ReplaceScoped { source, scope, edges }),
        1 => arb_id().prop_map(|id| Operation::Delete { id }),
    ]
}

fn to_usage(edges: &[(Relation, ObjectId)]) -> UsageInfo {
    let mut usage = UsageInfo::new();
    for (relation, target) in edges {
        usage.insert(relation.clone(), target.clone());
    }
    usage
}

fn apply(model: &mut Model, op: &Operation) {
    match op {
        Operation::Replace { source, edges } => {
            let fresh: BTreeSet<_> = edges.iter().cloned().collect();
            model.insert(source.clone(), fresh);
        }
        Operation::ReplaceScoped {
            source,
            scope,
            edges,
        } => {
            let entry = model.entry(source.clone()).or_default();
            entry.retain(|(_, target)| !target.is_kind(scope));
            entry.extend(edges.iter().filter(|(_, t)| t.is_kind(scope)).cloned());
        }
        Operation::Delete { id } => {
            model.remove(id);
            for edges in model.values_mut() {
                edges.retain(|(_, target)| target != id);
            }
        }
    }
    model.retain(|_, edges| !edges.is_empty());
}

fn forward_of(index: &EdgeIndex) -> Model {
    index
        .snapshot()
        .into_iter()
        .map(|(source, usage)| {
            let edges = usage
                .iter()
                .flat_map(|(rel, targets)| targets.iter().map(move |t| (rel.clone(), t.clone())))
                .collect();
            (source, edges)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_index_matches_model_and_stays_symmetric(ops in prop::collection::vec(arb_operation(), 1..60)) {
        let index = EdgeIndex::new();
        let mut model = Model::new();

        for op in &ops {
            match op {
                Operation::Replace { source, edges } => {
                    index.replace_object_usage_info(source, &to_usage(edges));
                }
                Operation::ReplaceScoped { source, scope, edges } => {
                    index.replace_object_usage_info_for_kinds(source, std::slice::from_ref(scope), &to_usage(edges));
                }
                Operation::Delete { id } => {
                    index.delete_object(id);
                }
            }
            apply(&mut model, op);

            let report = index.verify();
            prop_assert!(report.is_clean(), "asymmetric after {:?}: {:?}", op, report);
            prop_assert_eq!(&forward_of(&index), &model);
        }

        for (source, edges) in &model {
            for (relation, target) in edges {
                prop_assert!(index.get_users_for_relation(target, relation).contains(source));
            }
        }
    }

    #[test]
    fn prop_replace_is_idempotent(source in arb_id(), edges in arb_edges()) {
        let index = EdgeIndex::new();
        let usage = to_usage(&edges);
        index.replace_object_usage_info(&source, &usage);
        let before = index.snapshot();
        let delta = index.replace_object_usage_info(&source, &usage);
        prop_assert!(delta.is_empty());
        prop_assert_eq!(index.snapshot(), before);
    }

    #[test]
    fn prop_scoped_replace_preserves_other_kinds(
        source in arb_id(),
        initial in arb_edges(),
        scope in arb_kind(),
        update in arb_edges(),
    ) {
        let index = EdgeIndex::new();
        index.replace_object_usage_info(&source, &to_usage(&initial));
        let outside: BTreeSet<_> = initial.iter().filter(|(_, t)| !t.is_kind(&scope)).cloned().collect();

        index.replace_object_usage_info_for_kinds(&source, std::slice::from_ref(&scope), &to_usage(&update));
        let after: BTreeSet<(Relation, ObjectId)> = forward_of(&index).remove(&source).unwrap_or_default();
        let kept: BTreeSet<_> = after.iter().filter(|(_, t)| !t.is_kind(&scope)).cloned().collect();
        prop_assert_eq!(kept, outside);
    }
}
