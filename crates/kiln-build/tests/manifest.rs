//! Manifest wire format.
use std::collections::BTreeMap;
use std::time::Duration;

use kiln_build::instruction::{Command, Healthcheck, HealthcheckSpec, PortSpec, Protocol};
use kiln_build::{ImagePackager, Layer, StageConfig};
use kiln_common::Digest;

fn service_config() -> StageConfig {
    let mut check = HealthcheckSpec::new(Command::Shell(
        "curl -f http://localhost:8080/health || exit 1".into(),
    ));
    check.timeout = Duration::from_secs(5);

    StageConfig {
        env: BTreeMap::from([
            ("TZ".to_string(), "UTC".to_string()),
            ("JAVA_OPTS".to_string(), "-Xmx256m".to_string()),
        ]),
        user: Some("app".into()),
        workdir: "/app".into(),
        entrypoint: Some(vec!["java".into(), "-jar".into(), "app.jar".into()]),
        cmd: Some(vec!["--port".into(), "8080".into()]),
        exposed_ports: [
            PortSpec {
                port: 9090,
                protocol: Protocol::Udp,
            },
            PortSpec {
                port: 8080,
                protocol: Protocol::Tcp,
            },
        ]
        .into(),
        healthcheck: Some(Healthcheck::Check(check)),
        labels: BTreeMap::from([(
            "org.opencontainers.image.title".to_string(),
            "service".to_string(),
        )]),
    }
}

fn layers() -> Vec<Layer> {
    vec![
        Layer {
            digest: Digest::of("base layer"),
            size: 10,
            created_by: "RUN apt-get install -y curl".into(),
        },
        Layer {
            digest: Digest::of("app layer"),
            size: 9,
            created_by: "COPY --from=builder /build/app.jar app.jar".into(),
        },
    ]
}

#[test]
fn canonical_manifest_json() {
    let manifest = ImagePackager::for_platform("linux", "amd64")
        .package(&service_config(), &layers())
        .unwrap();
    let json = String::from_utf8(manifest.to_canonical_json().unwrap()).unwrap();

    insta::assert_snapshot!(json, @r#"{"schemaVersion":2,"mediaType":"application/vnd.kiln.image.manifest.v1+json","architecture":"amd64","os":"linux","config":{"Entrypoint":["java","-jar","app.jar"],"Cmd":["--port","8080"],"Env":["JAVA_OPTS=-Xmx256m","TZ=UTC"],"ExposedPorts":{"8080/tcp":{},"9090/udp":{}},"Healthcheck":{"Test":["CMD-SHELL","curl -f http://localhost:8080/health || exit 1"],"Interval":30000000000,"Timeout":5000000000,"StartPeriod":0,"Retries":3},"WorkingDir":"/app","User":"app","Labels":{"org.opencontainers.image.title":"service"}},"layers":[{"mediaType":"application/vnd.oci.image.layer.v1.tar","digest":"sha256:31b1bea262a65f3b89522e134cef5e65962a5c1727666859ef2448fd439ccccf","size":10,"createdBy":"RUN apt-get install -y curl"},{"mediaType":"application/vnd.oci.image.layer.v1.tar","digest":"sha256:bf1f86c98c9625a38922cbd7f57b12cabe5817a82d950a83f072a744d2c1db66","size":9,"createdBy":"COPY --from=builder /build/app.jar app.jar"}]}"#);

    assert_eq!(
        manifest.digest().unwrap().to_string(),
        "sha256:3ce3a4097d27305ccdf3ba59023c0c589be5d9bf5dbd3376255823a382cf8eec"
    );
}

#[test]
fn layer_order_changes_the_digest() {
    let packager = ImagePackager::for_platform("linux", "amd64");
    let mut reversed = layers();
    reversed.reverse();

    let forward = packager.package(&service_config(), &layers()).unwrap();
    let backward = packager.package(&service_config(), &reversed).unwrap();
    assert_ne!(forward.digest().unwrap(), backward.digest().unwrap());
}
