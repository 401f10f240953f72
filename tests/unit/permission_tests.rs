//! Unit tests for permission-prompt option selection.

use acp_bridge::acp::protocol::{
    select_permission_option, PermissionOption, PermissionOptionKind,
};

fn option(id: &str, kind: PermissionOptionKind) -> PermissionOption {
    PermissionOption {
        option_id: id.to_owned(),
        name: id.to_owned(),
        kind,
    }
}

/// `allow_always` wins even when listed after `allow_once`.
#[test]
fn prefers_allow_always_over_allow_once() {
    let options = vec![
        option("once", PermissionOptionKind::AllowOnce),
        option("always", PermissionOptionKind::AllowAlways),
    ];

    let selected = select_permission_option(&options).expect("an option must be selected");
    assert_eq!(selected.option_id, "always");
}

/// Without `allow_always`, the first `allow_once` is selected.
#[test]
fn falls_back_to_allow_once() {
    let options = vec![
        option("reject", PermissionOptionKind::RejectOnce),
        option("once-a", PermissionOptionKind::AllowOnce),
        option("once-b", PermissionOptionKind::AllowOnce),
    ];

    let selected = select_permission_option(&options).expect("an option must be selected");
    assert_eq!(selected.option_id, "once-a");
}

/// With no allow option at all, the first offered option is selected —
/// the bridge approves rather than rejects.
#[test]
fn no_allow_option_selects_first() {
    let options = vec![
        option("reject-always", PermissionOptionKind::RejectAlways),
        option("reject-once", PermissionOptionKind::RejectOnce),
    ];

    let selected = select_permission_option(&options).expect("an option must be selected");
    assert_eq!(selected.option_id, "reject-always");
}

/// An empty option list selects nothing.
#[test]
fn empty_options_select_nothing() {
    assert!(select_permission_option(&[]).is_none());
}
