use geo::Point;

use crate::types::{Category, DisplayMode, PointRecord};
use crate::view::ViewState;

/// Seam between the view controller and whatever draws the layers. A backend
/// hands out a handle per attached layer and must be able to detach it again.
pub trait LayerBackend {
    type Handle;

    fn attach(&mut self, mode: DisplayMode, points: &[PointRecord]) -> Self::Handle;
    fn detach(&mut self, handle: Self::Handle);
}

/// Owns the raw dataset, the view state and at most one attached overlay.
///
/// Every state change goes through [`MapView::refresh`], which detaches the
/// previous overlay before attaching its replacement. Switching modes is a
/// full replace, never an incremental diff, so the backend never holds two
/// overlays at once. `Drop` releases the overlay regardless of exit path.
pub struct MapView<B: LayerBackend> {
    backend: B,
    raw: Vec<PointRecord>,
    state: ViewState,
    overlay: Option<B::Handle>,
}

impl<B: LayerBackend> MapView<B> {
    pub fn new(backend: B, raw: Vec<PointRecord>, state: ViewState) -> Self {
        let mut view = MapView { backend, raw, state, overlay: None };
        view.refresh();
        view
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn raw_points(&self) -> &[PointRecord] {
        &self.raw
    }

    pub fn visible_points(&self) -> Vec<PointRecord> {
        self.state.visible_points(&self.raw)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn overlay(&self) -> Option<&B::Handle> {
        self.overlay.as_ref()
    }

    pub fn set_mode(&mut self, mode: DisplayMode) {
        if self.state.mode != mode {
            self.state.mode = mode;
            self.refresh();
        }
    }

    pub fn set_visibility(&mut self, category: Category, visible: bool) {
        if self.state.flags.enabled(category) != visible {
            self.state.flags.set(category, visible);
            self.refresh();
        }
    }

    pub fn set_center(&mut self, lat: f64, lon: f64) -> anyhow::Result<()> {
        // Recentering moves the viewport only; layers are untouched.
        self.state.set_center(lat, lon)
    }

    pub fn center(&self) -> Point<f64> {
        self.state.center
    }

    /// Detach-before-attach. The single place an overlay is created.
    fn refresh(&mut self) {
        if let Some(handle) = self.overlay.take() {
            self.backend.detach(handle);
        }
        let visible = self.state.visible_points(&self.raw);
        self.overlay = Some(self.backend.attach(self.state.mode, &visible));
    }
}

impl<B: LayerBackend> Drop for MapView<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.overlay.take() {
            self.backend.detach(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// Records attach/detach traffic so tests can check how many layers of
    /// each mode are alive at any point.
    #[derive(Default)]
    struct Ledger {
        next_id: u64,
        live: HashMap<u64, DisplayMode>,
        max_live_clusters: usize,
        max_live_total: usize,
    }

    #[derive(Default, Clone)]
    struct RecordingBackend {
        ledger: Rc<RefCell<Ledger>>,
    }

    impl RecordingBackend {
        fn live_count(&self, mode: DisplayMode) -> usize {
            self.ledger.borrow().live.values().filter(|m| **m == mode).count()
        }
        fn live_total(&self) -> usize {
            self.ledger.borrow().live.len()
        }
    }

    impl LayerBackend for RecordingBackend {
        type Handle = u64;

        fn attach(&mut self, mode: DisplayMode, _points: &[PointRecord]) -> u64 {
            let mut ledger = self.ledger.borrow_mut();
            ledger.next_id += 1;
            let id = ledger.next_id;
            ledger.live.insert(id, mode);
            let clusters =
                ledger.live.values().filter(|m| **m == DisplayMode::Cluster).count();
            ledger.max_live_clusters = ledger.max_live_clusters.max(clusters);
            ledger.max_live_total = ledger.max_live_total.max(ledger.live.len());
            id
        }

        fn detach(&mut self, handle: u64) {
            self.ledger.borrow_mut().live.remove(&handle);
        }
    }

    fn points() -> Vec<PointRecord> {
        vec![PointRecord {
            position: Point::new(-35.7, -9.6),
            label: "Pousada X".to_string(),
            category: Category::Lodging,
        }]
    }

    fn view(backend: RecordingBackend) -> MapView<RecordingBackend> {
        let state = ViewState::new(Point::new(-36.7819, -9.5713), 9);
        MapView::new(backend, points(), state)
    }

    #[test]
    fn mode_switching_never_stacks_cluster_layers() {
        let backend = RecordingBackend::default();
        let mut view = view(backend.clone());

        for _ in 0..10 {
            view.set_mode(DisplayMode::Cluster);
            view.set_mode(DisplayMode::Markers);
            view.set_mode(DisplayMode::Cluster);
            view.set_mode(DisplayMode::Heatmap);
        }

        let ledger = backend.ledger.borrow();
        assert!(ledger.max_live_clusters <= 1, "stale cluster layer leaked");
        assert!(ledger.max_live_total <= 1, "more than one overlay attached");
    }

    #[test]
    fn visibility_toggle_replaces_the_overlay() {
        let backend = RecordingBackend::default();
        let mut view = view(backend.clone());
        assert_eq!(backend.live_total(), 1);

        view.set_visibility(Category::Lodging, false);
        assert_eq!(backend.live_total(), 1);
        assert!(view.visible_points().is_empty());

        // No-op toggle keeps the existing overlay.
        let before = backend.ledger.borrow().next_id;
        view.set_visibility(Category::Lodging, false);
        assert_eq!(backend.ledger.borrow().next_id, before);
    }

    #[test]
    fn drop_detaches_the_overlay() {
        let backend = RecordingBackend::default();
        {
            let mut view = view(backend.clone());
            view.set_mode(DisplayMode::Cluster);
            assert_eq!(backend.live_count(DisplayMode::Cluster), 1);
        }
        assert_eq!(backend.live_total(), 0);
    }

    #[test]
    fn recenter_does_not_touch_layers() {
        let backend = RecordingBackend::default();
        let mut view = view(backend.clone());
        let before = backend.ledger.borrow().next_id;
        view.set_center(-9.66599, -35.735).unwrap();
        assert_eq!(backend.ledger.borrow().next_id, before);
    }
}
