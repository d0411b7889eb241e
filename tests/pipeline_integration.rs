//! End-to-end runs: survey index → local connector → pipeline → hooks.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use fetchez::commands::{run_local, LocalRun};
use fetchez::config::Config;
use fetchez::connector_local::{LocalIndexConnector, LocalMode};
use fetchez::hooks::{HookArgs, HookRegistry, Stage};
use fetchez::index::SurveyIndex;
use fetchez::models::{Geometry, Properties};
use fetchez::pipeline::{collect_entries, HookErrorPolicy, Pipeline};
use fetchez::traits::ConnectorRegistry;
use fetchez::transport_fs::LocalTransport;

fn write_zip(path: &Path, members: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, body) in members {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

fn props(value: Value) -> Properties {
    value.as_object().cloned().unwrap()
}

/// An index with one zipped tile inside the test region and one outside.
fn coast_index(path: PathBuf, src: &Path) -> SurveyIndex {
    let inside = src.join("tile.zip");
    write_zip(&inside, &[("a.xyz", "1 2 3\n"), ("b.xyz", "4 5 6\n")]);
    let outside = src.join("far.tif");
    fs::write(&outside, "raster").unwrap();

    let mut index = SurveyIndex::at_path("coast", path);
    index.add_survey(
        Geometry::rectangle(-90.0, -89.0, 29.0, 30.0),
        props(json!({
            "Name": "tile",
            "DataLink": format!("file://{}", inside.display()),
            "DataType": "xyz",
            "Agency": "NOAA",
        })),
    );
    index.add_survey(
        Geometry::rectangle(10.0, 11.0, 40.0, 41.0),
        props(json!({
            "Name": "far",
            "DataLink": format!("file://{}", outside.display()),
            "DataType": "raster",
            "Agency": "USGS",
        })),
    );
    index
}

#[tokio::test]
async fn local_run_unzips_and_focuses_on_members() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data");
    let src = tmp.path().join("src");
    fs::create_dir_all(&data).unwrap();
    fs::create_dir_all(&src).unwrap();
    coast_index(data.join("coast.geojson"), &src).write().unwrap();

    let mut config = Config::minimal();
    config.paths.data_dir = Some(data);
    config.pipeline.workers = 2;

    let outdir = tmp.path().join("out");
    let summary = run_local(
        &config,
        LocalRun {
            index: "coast".to_string(),
            region: Some("-89.5/-88.5/29.5/30.5".to_string()),
            mode: LocalMode::Copy,
            outdir: outdir.clone(),
            hooks: vec!["unzip".to_string(), "focus:target=unzip".to_string()],
            ..LocalRun::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.queued, 1);
    assert_eq!(summary.transferred, 1);
    assert_eq!(summary.succeeded, 1);

    let staged = outdir.join("local");
    assert!(staged.join("tile.zip").exists());
    assert_eq!(fs::read_to_string(staged.join("b.xyz")).unwrap(), "4 5 6\n");

    let dsts: Vec<PathBuf> = summary
        .items
        .iter()
        .map(|i| i.entry.dst_fn.clone().unwrap())
        .collect();
    assert_eq!(dsts.len(), 2);
    assert!(dsts[0].ends_with("a.xyz"));
    assert!(dsts[1].ends_with("b.xyz"));
    for item in &summary.items {
        assert_eq!(item.entry.data_type.as_deref(), Some("unzip_artifact"));
        assert!(item.entry.url.starts_with("file://"));
        assert!(item.entry.is_success());
    }
}

#[tokio::test]
async fn unknown_preset_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let result = run_local(
        &Config::minimal(),
        LocalRun {
            index: "nothing".to_string(),
            outdir: tmp.path().to_path_buf(),
            presets: vec!["no-such-preset".to_string()],
            ..LocalRun::default()
        },
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn script_hook_checksum_and_audit_in_one_run() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    let index = coast_index(tmp.path().join("coast.geojson"), &src);

    let hooks_dir = tmp.path().join("hooks");
    fs::create_dir_all(&hooks_dir).unwrap();
    fs::write(
        hooks_dir.join("stamp.lua"),
        r#"
hook = { name = "stamp", desc = "Tag each entry", options = { label = "none" } }
function hook.run(items, opts)
    for _, item in ipairs(items) do
        item.entry.label = opts.label .. ":" .. item.connector
    end
    return items
end
"#,
    )
    .unwrap();

    let mut registry = HookRegistry::with_builtins();
    assert_eq!(registry.load_user_hooks(&[hooks_dir], 5), 1);
    assert_eq!(registry.get("stamp").unwrap().info.stage, Stage::File);

    let audit_file = tmp.path().join("audit.json");
    let hooks = vec![
        registry
            .create("stamp", &HookArgs::new().with("label", "run1"))
            .unwrap(),
        registry
            .create("checksum", &HookArgs::new().with("algo", "sha256"))
            .unwrap(),
        registry
            .create(
                "audit",
                &HookArgs::new().with("file", audit_file.to_string_lossy().to_string()),
            )
            .unwrap(),
    ];

    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(
        LocalIndexConnector::new(index, tmp.path().join("out")).with_mode(LocalMode::Copy),
    ));

    let items = collect_entries(&connectors).await;
    assert_eq!(items.len(), 2);

    let summary = Pipeline::new(hooks)
        .with_policy(HookErrorPolicy::Abort)
        .with_workers(2)
        .run(items, Arc::new(LocalTransport))
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    for item in &summary.items {
        assert_eq!(item.entry.get("label"), Some(&json!("run1:local")));
        let hash = item.entry.get("sha256_hash").and_then(Value::as_str).unwrap();
        assert_eq!(hash.len(), 64);
    }

    let audit: Value = serde_json::from_str(&fs::read_to_string(&audit_file).unwrap()).unwrap();
    let rows = audit.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["label"], "run1:local");
}
