use spantree::persistent::{load_settings_in, save_settings_in, FilterPreset, ViewSettings};

#[test]
fn test_missing_settings_use_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = load_settings_in(&dir.path().join("not-there")).unwrap();
    assert_eq!(settings, ViewSettings::default());
    assert_eq!(settings.min_sibling_group_size, 5);
    assert_eq!(settings.gap_threshold, None);
}

#[test]
fn test_settings_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("spantree");
    let settings = ViewSettings {
        min_sibling_group_size: 3,
        gap_threshold: Some(0.25),
        filter_presets: vec![
            FilterPreset::new("network", &["http", "http.client"]),
            FilterPreset::new("storage", &["db"]),
        ],
    };

    save_settings_in(&folder, &settings).unwrap();
    assert_eq!(load_settings_in(&folder).unwrap(), settings);

    // Only the final file is left behind
    let files: Vec<String> = std::fs::read_dir(&folder)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(files, vec!["persistent_data.json".to_string()]);

    let raw = std::fs::read_to_string(folder.join("persistent_data.json")).unwrap();
    assert!(raw.contains("\"V1\""));
}

#[test]
fn test_partial_settings_fill_in_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("persistent_data.json"),
        r#"{"V1": {"settings": {"gap_threshold": 1.5}}}"#,
    )
    .unwrap();

    let settings = load_settings_in(dir.path()).unwrap();
    assert_eq!(settings.gap_threshold, Some(1.5));
    assert_eq!(settings.min_sibling_group_size, 5);
    assert!(settings.filter_presets.is_empty());
}

#[test]
fn test_corrupted_settings_are_an_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("persistent_data.json"), "not json").unwrap();
    assert!(load_settings_in(dir.path()).is_err());
}
