//! Stage graph ordering properties.
use std::collections::BTreeSet;
use std::fmt::Write;

use kiln_build::descriptor::BuildArgs;
use kiln_build::{StageGraph, parse_descriptor};
use kiln_common::KilnError;
use proptest::prelude::*;

const JAVA_SERVICE: &str = r#"
FROM maven:3.9-eclipse-temurin-21 AS builder
WORKDIR /build
COPY pom.xml .
RUN mvn dependency:go-offline
COPY src ./src
RUN mvn package -DskipTests

FROM eclipse-temurin:21-jre AS runtime
WORKDIR /app
COPY --from=builder /build/target/app.jar app.jar
EXPOSE 8080
HEALTHCHECK --interval=30s CMD curl -f http://localhost:8080/health || exit 1
ENTRYPOINT ["java", "-jar", "app.jar"]

FROM builder AS test
RUN mvn verify
"#;

fn graph(text: &str) -> Result<StageGraph, KilnError> {
    StageGraph::build(parse_descriptor(text, &BuildArgs::new())?)
}

/// Random DAG: stage `i` may depend on `j` only when `rank[j] < rank[i]`,
/// so references point both forwards and backwards in the file.
fn dag() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1usize..9)
        .prop_flat_map(|n| {
            (
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                prop::collection::vec(any::<bool>(), n * n),
            )
        })
        .prop_map(|(rank, edges)| {
            let n = rank.len();
            (0..n)
                .map(|i| {
                    (0..n)
                        .filter(|&j| rank[j] < rank[i] && edges[i * n + j])
                        .collect()
                })
                .collect()
        })
}

fn render_descriptor(deps: &[BTreeSet<usize>]) -> String {
    let mut text = String::new();
    for (i, needs) in deps.iter().enumerate() {
        let _ = writeln!(text, "FROM scratch AS s{i}");
        for dep in needs {
            let _ = writeln!(text, "COPY --from=s{dep} /out /in/{dep}");
        }
        let _ = writeln!(text, "RUN build-{i}");
    }
    text
}

proptest! {
    #[test]
    fn order_respects_every_dependency(deps in dag()) {
        let graph = graph(&render_descriptor(&deps)).unwrap();

        let order = graph.order();
        prop_assert_eq!(order.len(), deps.len());
        let mut position = vec![usize::MAX; deps.len()];
        for (pos, &id) in order.iter().enumerate() {
            prop_assert_eq!(position[id], usize::MAX, "stage {} scheduled twice", id);
            position[id] = pos;
        }
        for (id, needs) in deps.iter().enumerate() {
            prop_assert_eq!(graph.dependencies(id), needs);
            for &dep in needs {
                prop_assert!(position[dep] < position[id]);
                prop_assert!(graph.dependents(dep).contains(&id));
            }
        }
    }

    #[test]
    fn order_is_stable(deps in dag()) {
        let text = render_descriptor(&deps);
        let first = graph(&text).unwrap();
        let second = graph(&text).unwrap();
        prop_assert_eq!(first.order(), second.order());
    }

    #[test]
    fn closure_contains_exactly_the_needed_stages(deps in dag()) {
        let graph = graph(&render_descriptor(&deps)).unwrap();
        let target = deps.len() - 1;

        let mut needed = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if needed.insert(id) {
                stack.extend(deps[id].iter().copied());
            }
        }

        let closure = graph.closure(target);
        prop_assert_eq!(closure.iter().copied().collect::<BTreeSet<_>>(), needed);
        prop_assert_eq!(closure.last(), Some(&target));
    }

    #[test]
    fn closing_a_loop_is_a_cycle(deps in dag()) {
        prop_assume!(deps.len() > 1);
        let graph = graph(&render_descriptor(&deps)).unwrap();
        let (first, last) = (graph.order()[0], graph.order()[deps.len() - 1]);

        let mut looped = deps;
        looped[first].insert(last);
        looped[last].insert(first);

        let err = graph_err(&render_descriptor(&looped));
        prop_assert!(matches!(err, KilnError::Cycle { .. }), "{err:?}");
    }
}

fn graph_err(text: &str) -> KilnError {
    match graph(text) {
        Ok(graph) => panic!("expected an error, got order {:?}", graph.order()),
        Err(e) => e,
    }
}

#[test]
fn java_service_order() {
    let graph = graph(JAVA_SERVICE).unwrap();
    insta::assert_snapshot!(graph.render(), @r"
    1. builder from maven:3.9-eclipse-temurin-21: 5 instructions, 4 layers
    2. runtime from eclipse-temurin:21-jre: 5 instructions, 1 layers (needs builder)
    3. test from stage builder: 1 instructions, 1 layers (needs builder)
    ");
}

#[test]
fn cycle_names_the_loop() {
    let err = graph_err("FROM scratch AS a\nCOPY --from=b /x /x\nFROM scratch AS b\nCOPY --from=a /y /y\n");
    let KilnError::Cycle { stages } = err else {
        panic!("expected a cycle, got {err:?}");
    };
    assert_eq!(stages.first(), stages.last());
    assert_eq!(stages.len(), 3);
}

#[test]
fn unknown_copy_source() {
    let err = graph_err("FROM scratch AS app\nCOPY --from=missing /out /out\n");
    assert!(matches!(
        err,
        KilnError::UnknownStageReference { ref reference, .. } if reference == "missing"
    ));
}
