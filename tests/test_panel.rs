use birdcast::io::{read_panel, write_panel};
use birdcast::panel::{PanelConfig, PanelRow};
use birdcast::{update_panel, Observation, RollingPanel};
use chrono::NaiveDate;

fn obs(checklist: &str, species: &str, county: &str, date: &str) -> Observation {
    Observation {
        checklist_id: checklist.to_string(),
        common_name: species.to_string(),
        county: county.to_string(),
        observation_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
    }
}

/// County A: ten checklists in ISO week 1 of 2020, three of them with "X",
/// plus four checklists in week 10. County B: six checklists in week 52.
fn two_county_batch() -> Vec<Observation> {
    let mut batch = Vec::new();
    for i in 1..=10 {
        let species = if i <= 3 { "X" } else { "Y" };
        batch.push(obs(&format!("a{}", i), species, "A", "2020-01-02"));
    }
    for i in 1..=4 {
        batch.push(obs(&format!("w{}", i), "Y", "A", "2020-03-04"));
    }
    for i in 1..=6 {
        batch.push(obs(&format!("b{}", i), "Y", "B", "2020-12-22"));
    }
    batch
}

fn find<'a>(panel: &'a RollingPanel, species: &str, county: &str, week: u32) -> &'a PanelRow {
    panel
        .rows()
        .iter()
        .find(|r| r.common_name == species && r.county == county && r.week == week)
        .unwrap()
}

#[test]
fn two_county_scenario() {
    let update = update_panel(&RollingPanel::new(), &two_county_batch(), &PanelConfig::default())
        .unwrap();
    let panel = &update.panel;

    // 2 species x 2 counties x 52 weeks
    assert_eq!(panel.len(), 208);
    assert_eq!(update.rows_added, 208);

    let a1 = find(panel, "X", "A", 1);
    assert_eq!(a1.year, 2020);
    assert_eq!(a1.species_checklists, Some(3));
    assert_eq!(a1.total_checklists, Some(10));
    assert_eq!(a1.detection_rate, Some(0.3));

    // No checklists in county B that week: missing, not zero
    let b1 = find(panel, "X", "B", 1);
    assert_eq!(b1.total_checklists, None);
    assert_eq!(b1.detection_rate, None);
}

#[test]
fn detection_rate_policy_holds_for_every_row() {
    let update = update_panel(&RollingPanel::new(), &two_county_batch(), &PanelConfig::default())
        .unwrap();
    for row in update.panel.rows() {
        match row.total_checklists {
            Some(total) if total > 5 => {
                if row.species_checklists.is_none() {
                    assert_eq!(row.detection_rate, Some(0.0));
                }
            }
            _ => assert_eq!(row.detection_rate, None),
        }
    }

    // Four checklists is too little effort
    assert_eq!(find(&update.panel, "Y", "A", 10).detection_rate, None);
    // Six checklists, none with "X"
    assert_eq!(find(&update.panel, "X", "B", 52).detection_rate, Some(0.0));
    assert_eq!(find(&update.panel, "Y", "B", 52).detection_rate, Some(1.0));
}

#[test]
fn applying_the_same_batch_twice_is_idempotent() {
    let batch = two_county_batch();
    let config = PanelConfig::default();
    let once = update_panel(&RollingPanel::new(), &batch, &config).unwrap();
    let twice = update_panel(&once.panel, &batch, &config).unwrap();

    assert_eq!(twice.rows_added, 0);
    assert_eq!(twice.stale_records_dropped, batch.len());
    assert_eq!(twice.panel, once.panel);
}

#[test]
fn idempotent_through_persisted_panel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("allbirds_detection.feather");
    let batch = two_county_batch();
    let config = PanelConfig::default();

    let first = update_panel(&read_panel(&path).unwrap(), &batch, &config).unwrap();
    write_panel(&path, &first.panel).unwrap();

    let reloaded = read_panel(&path).unwrap();
    assert_eq!(reloaded, first.panel);
    let second = update_panel(&reloaded, &batch, &config).unwrap();
    assert_eq!(second.panel, first.panel);
}

#[test]
fn next_batch_appends_new_weeks() {
    let config = PanelConfig::default();
    let first = update_panel(&RollingPanel::new(), &two_county_batch(), &config).unwrap();

    // ISO week 2 of 2021, county A only
    let next: Vec<Observation> = (1..=7)
        .map(|i| obs(&format!("n{}", i), "Z", "A", "2021-01-13"))
        .collect();
    let second = update_panel(&first.panel, &next, &config).unwrap();

    // Historical species X and Y plus new Z, county A, weeks 1..=2
    assert_eq!(second.rows_added, 3 * 2);
    assert_eq!(second.panel.len(), first.panel.len() + 6);
    let z = second
        .panel
        .rows()
        .iter()
        .find(|r| r.common_name == "Z" && r.year == 2021 && r.week == 2)
        .unwrap();
    assert_eq!(z.detection_rate, Some(1.0));
    let x = second
        .panel
        .rows()
        .iter()
        .find(|r| r.common_name == "X" && r.year == 2021 && r.week == 2)
        .unwrap();
    assert_eq!(x.detection_rate, Some(0.0));
}

#[test]
fn partial_year_updates_keep_keys_unique() {
    let config = PanelConfig::default();
    let weekly = |prefix: &str, dates: &[&str]| -> Vec<Observation> {
        dates
            .iter()
            .enumerate()
            .flat_map(|(w, date)| {
                (1..=8).map(move |i| obs(&format!("{}{}-{}", prefix, w, i), "X", "A", date))
            })
            .collect()
    };

    // ISO weeks 1..=3 of 2022, then weeks 4..=5 of the same year
    let first = weekly("p", &["2022-01-05", "2022-01-12", "2022-01-19"]);
    let second = weekly("q", &["2022-01-26", "2022-02-02"]);

    let after_first = update_panel(&RollingPanel::new(), &first, &config).unwrap();
    assert_eq!(after_first.rows_added, 3);
    let after_second = update_panel(&after_first.panel, &second, &config).unwrap();
    assert_eq!(after_second.rows_added, 2);

    let panel = &after_second.panel;
    assert_eq!(panel.len(), 5);
    let mut keys = std::collections::HashSet::new();
    for row in panel.rows() {
        assert!(
            keys.insert((row.common_name.clone(), row.county.clone(), row.year, row.week)),
            "duplicate row for week {} of {}",
            row.week,
            row.year
        );
    }
    let weeks: Vec<u32> = panel.rows().iter().map(|r| r.week).collect();
    assert_eq!(weeks, vec![1, 2, 3, 4, 5]);
    assert_eq!(find(panel, "X", "A", 1).detection_rate, Some(1.0));
    assert_eq!(find(panel, "X", "A", 5).detection_rate, Some(1.0));

    // Reloading and reapplying the second batch adds nothing
    let again = update_panel(panel, &second, &config).unwrap();
    assert_eq!(again.rows_added, 0);
    assert_eq!(&again.panel, panel);
}
