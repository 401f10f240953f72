//! Unit tests for branch slug generation.

use acp_bridge::repo::slugify;

#[test]
fn lowercases_and_hyphenates() {
    assert_eq!(slugify("Fix Login Bug", 60), "fix-login-bug");
    assert_eq!(slugify("ISSUE #42: crash on save!", 60), "issue-42-crash-on-save");
}

#[test]
fn collapses_runs_of_separators() {
    assert_eq!(slugify("a -- b ___ c", 60), "a-b-c");
}

#[test]
fn strips_leading_and_trailing_hyphens() {
    assert_eq!(slugify("--weird--", 60), "weird");
}

#[test]
fn truncates_to_max_length_without_trailing_hyphen() {
    let slug = slugify("long words repeated over and over again", 12);
    assert!(slug.len() <= 12, "slug too long: {slug}");
    assert!(!slug.ends_with('-'), "no trailing hyphen: {slug}");
}

#[test]
fn empty_input_falls_back_to_task() {
    assert_eq!(slugify("", 60), "task");
    assert_eq!(slugify("!!!", 60), "task");
}

#[test]
fn unicode_is_dropped_not_panicked() {
    assert_eq!(slugify("héllo wörld", 60), "h-llo-w-rld");
}
