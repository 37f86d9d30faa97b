use super::*;

#[test]
fn parse_envi_skips_header_line() {
    let text = "Environment:\nzookeeper.version=3.8.1-abc, built on 2023\nhost.name=zk1\njava.class.path=/a:/b=c\n";
    let parsed = parse_diagnostic(text);

    assert_eq!(parsed.len(), 3);
    assert_eq!(parsed["zookeeper.version"], "3.8.1-abc, built on 2023");
    assert_eq!(parsed["host.name"], "zk1");
    // only the first separator splits
    assert_eq!(parsed["java.class.path"], "/a:/b=c");
}

#[test]
fn parse_mntr_tab_separated_without_header() {
    let text = "zk_version\t3.8.1\nzk_avg_latency\t0\nzk_server_state\tleader\n";
    let parsed = parse_diagnostic(text);

    assert_eq!(parsed.len(), 3);
    assert_eq!(parsed["zk_server_state"], "leader");
    assert_eq!(parsed["zk_avg_latency"], "0");
}

#[test]
fn parse_splits_on_whichever_separator_comes_first() {
    let parsed = parse_diagnostic("a\tb=c\nd=e\tf\n");
    assert_eq!(parsed["a"], "b=c");
    assert_eq!(parsed["d"], "e\tf");
}

#[test]
fn parse_ignores_blank_and_separatorless_lines() {
    let parsed = parse_diagnostic("\n\nk=v\nnoise\n\n");
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed["k"], "v");
}

#[test]
fn parse_empty_text() {
    assert!(parse_diagnostic("").is_empty());
}
