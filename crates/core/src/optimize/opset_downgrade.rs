use crate::model::Model;

/// Newest opset the target runtimes are known to accept. Saving a model
/// at this opset yields IR version 6.
pub const DEFAULT_TARGET_OPSET: i64 = 11;

/// Clamps the model's opset to `target`. Returns whether anything
/// changed. The saver derives the IR version from the opset, so the
/// persisted file downgrades with it.
pub fn downgrade_opset(model: &mut Model, target: i64) -> bool {
    if model.opset_version <= target {
        return false;
    }

    log::info!(
        "downgrade_opset: {} -> {}",
        model.opset_version,
        target
    );
    model.opset_version = target;

    true
}

#[test]
fn clamps_newer_opset() {
    let mut m = Model {
        opset_version: 13,
        ..Model::default()
    };
    assert!(downgrade_opset(&mut m, DEFAULT_TARGET_OPSET));
    assert_eq!(m.opset_version, 11);
}

#[test]
fn older_opset_untouched() {
    let mut m = Model {
        opset_version: 9,
        ..Model::default()
    };
    assert!(!downgrade_opset(&mut m, DEFAULT_TARGET_OPSET));
    assert_eq!(m.opset_version, 9);
}
