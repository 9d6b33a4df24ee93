//! Session-level editing scenarios: gestures, history replay, and the
//! undo/redo round-trip guarantee.

use image::{GrayImage, Rgba, RgbaImage};

use layerforge::canvas::{BlendMode, Document};
use layerforge::tools::{EditorSession, Modifiers, PointerEvent, Tool};

fn solid(w: u32, h: u32, v: u8) -> RgbaImage {
    RgbaImage::from_pixel(w, h, Rgba([v, v, v, 255]))
}

fn press(x: f32, y: f32) -> PointerEvent {
    PointerEvent::Press { x, y, mods: Modifiers::default() }
}

fn drag(x: f32, y: f32) -> PointerEvent {
    PointerEvent::Drag { x, y, mods: Modifiers::default() }
}

fn release(x: f32, y: f32) -> PointerEvent {
    PointerEvent::Release { x, y, mods: Modifiers::default() }
}

/// Drive a session through every kind of mutation, then verify that undoing
/// everything restores the initial document and redoing everything restores
/// the final one, structurally.
#[test]
fn undo_all_then_redo_all_reproduces_both_endpoints() {
    let mut session = EditorSession::new(Document::new("doc", 256, 256));
    let initial = session.document.clone();

    let a = session.add_image(solid(80, 80, 10));
    let b = session.add_image(solid(60, 60, 200));
    session.set_opacity(a, 0.6).unwrap();
    session.set_blend_mode(b, BlendMode::Multiply).unwrap();
    session.set_visibility(a, false).unwrap();
    session.set_visibility(a, true).unwrap();
    session.reorder(b, 0).unwrap();
    session
        .set_layer_mask(a, Some(GrayImage::from_pixel(80, 80, image::Luma([128]))))
        .unwrap();

    // A drag gesture (one undo step) and a mask brush stroke (one more).
    session.selection.set(vec![a], &session.document);
    session.handle_pointer(press(40.0, 40.0));
    session.handle_pointer(drag(90.0, 70.0));
    session.handle_pointer(release(90.0, 70.0));

    session.tool = Tool::MaskBrush { radius: 6.0, value: 0 };
    session.handle_pointer(press(100.0, 100.0));
    session.handle_pointer(drag(120.0, 100.0));
    session.handle_pointer(release(140.0, 100.0));

    let c = session.add_image(solid(30, 30, 99));
    session.remove_layer(c).unwrap();

    let fin = session.document.clone();
    assert_ne!(fin, initial);

    // The history panel sees every step, most recent first.
    let descriptions = session.history.undo_history();
    assert_eq!(descriptions.len(), session.history.undo_count());
    assert_eq!(descriptions.last().unwrap(), "Add Layer: Layer 1");

    while session.undo().is_some() {}
    assert_eq!(session.document, initial);
    assert!(!session.history.can_undo());

    while session.redo().is_some() {}
    assert_eq!(session.document, fin);
    assert!(!session.history.can_redo());
}

#[test]
fn new_mutation_invalidates_the_redo_future() {
    let mut session = EditorSession::new(Document::new("doc", 128, 128));
    let a = session.add_image(solid(50, 50, 10));
    session.set_opacity(a, 0.5).unwrap();

    session.undo();
    assert!(session.history.can_redo());

    session.set_opacity(a, 0.25).unwrap();
    assert!(!session.history.can_redo());
    assert!((session.document.layer(a).unwrap().opacity - 0.25).abs() < 1e-6);
}

#[test]
fn pruned_history_still_undoes_cleanly() {
    let mut session = EditorSession::new(Document::new("doc", 128, 128));
    session.history = layerforge::history::HistoryManager::new(3);

    let a = session.add_image(solid(40, 40, 10));
    for i in 0..10 {
        session.set_opacity(a, 0.1 + 0.05 * i as f32).unwrap();
    }
    assert_eq!(session.history.undo_count(), 3);

    // Entries are self-contained, so undoing the surviving ones works even
    // though their predecessors were dropped.
    while session.undo().is_some() {}
    let opacity = session.document.layer(a).unwrap().opacity;
    assert!((opacity - (0.1 + 0.05 * 6.0)).abs() < 1e-6, "opacity = {}", opacity);
}

#[test]
fn rotation_gesture_is_one_undo_step_and_reverts_exactly() {
    let mut session = EditorSession::new(Document::new("doc", 256, 256));
    let id = session.add_image(solid(100, 100, 50));
    let before = session.document.layer(id).unwrap().transform;
    let steps = session.history.undo_count();

    // Selection bounds are (0,0)-(100,100); the rotate handle sits above the
    // top edge at (50, -24).
    session.handle_pointer(press(50.0, -24.0));
    session.handle_pointer(drag(80.0, -10.0));
    session.handle_pointer(drag(95.0, 20.0));
    session.handle_pointer(release(95.0, 20.0));

    assert_eq!(session.history.undo_count(), steps + 1);
    let after = session.document.layer(id).unwrap().transform;
    assert!(after.rotation != 0.0);

    session.undo();
    assert_eq!(session.document.layer(id).unwrap().transform, before);
}

#[test]
fn shift_resize_preserves_aspect_ratio() {
    let mut session = EditorSession::new(Document::new("doc", 512, 512));
    let id = session.add_image(solid(100, 100, 50));
    let shift = Modifiers { shift: true };

    // Drag the bottom-right corner mostly sideways with shift held.
    session.handle_pointer(PointerEvent::Press { x: 100.0, y: 100.0, mods: shift });
    session.handle_pointer(PointerEvent::Drag { x: 180.0, y: 110.0, mods: shift });
    session.handle_pointer(PointerEvent::Release { x: 180.0, y: 110.0, mods: shift });

    let t = session.document.layer(id).unwrap().transform;
    assert!(
        (t.scale_x - t.scale_y).abs() < 1e-6,
        "expected uniform scale, got {} x {}",
        t.scale_x,
        t.scale_y
    );
    assert!((t.scale_x - 1.8).abs() < 1e-3);
}

#[test]
fn fit_on_add_scales_oversized_images_to_the_canvas() {
    let mut session = EditorSession::new(Document::new("doc", 100, 100));
    session.fit_on_add = true;
    let id = session.add_image(solid(400, 200, 50));

    let t = session.document.layer(id).unwrap().transform;
    assert!((t.scale_x - 0.25).abs() < 1e-6);
    assert!((t.scale_y - 0.25).abs() < 1e-6);
    // Centered on the shorter axis.
    assert!((t.ty - 25.0).abs() < 1e-3);
    assert_eq!(t.tx, 0.0);

    // Small images are centered but never scaled up.
    let small = session.add_image(solid(10, 10, 5));
    let t = session.document.layer(small).unwrap().transform;
    assert_eq!(t.scale_x, 1.0);
    assert!((t.tx - 45.0).abs() < 1e-3);
    assert!((t.ty - 45.0).abs() < 1e-3);
}

#[test]
fn removing_a_selected_layer_drops_it_from_the_selection() {
    let mut session = EditorSession::new(Document::new("doc", 128, 128));
    let a = session.add_image(solid(40, 40, 10));
    assert!(session.selection.contains(a));

    session.remove_layer(a).unwrap();
    assert!(!session.selection.contains(a));
    assert!(session.selection.bounds.is_none());

    // Undo restores the layer but selection stays conservative: the id is
    // only re-added by an explicit user action.
    session.undo();
    assert!(session.document.layer(a).is_some());
}
