//! CLI smoke tests. Anything touching Postgres, Redis or the external
//! APIs is `#[ignore]`d; run those locally with the services up.

use cli_test_dir::*;

#[test]
fn help_lists_subcommands() {
    let testdir = TestDir::new("fuel-router", "help_lists_subcommands");
    let output = testdir.cmd().arg("--help").expect_success();
    assert!(output.stdout_str().contains("import"));
    assert!(output.stdout_str().contains("server"));
}

#[test]
fn import_help_lists_feed_options() {
    let testdir = TestDir::new("fuel-router", "import_help_lists_feed_options");
    let output = testdir.cmd().args(["import", "--help"]).expect_success();
    assert!(output.stdout_str().contains("--csv"));
    assert!(output.stdout_str().contains("--concurrent"));
    assert!(output.stdout_str().contains("--skip_attempted"));
    assert!(output.stdout_str().contains("--provider"));
}

#[test]
#[ignore]
fn import_a_tiny_feed() {
    // Needs DATABASE_URL pointing at a PostGIS-enabled database. Geocoding
    // hits the live Census API for one row.
    let testdir = TestDir::new("fuel-router", "import_a_tiny_feed");
    testdir.create_file(
        "feed.csv",
        "OPIS Truckstop ID,Truckstop Name,Address,City,State,Rack ID,Retail Price\n\
         900001,Test Travel Center,123 Main St,Miami,FL,7,3.459\n",
    );
    testdir
        .cmd()
        .args(["import", "--csv", "feed.csv", "--max", "1", "--concurrent", "1"])
        .expect_success();
}
