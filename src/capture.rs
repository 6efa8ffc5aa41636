//! Process attachment and screenshot capture.
//!
//! The backup engine only talks to the [`CaptureGateway`] trait. The default
//! [`SystemCaptureGateway`] binds to a process found by executable name and,
//! on macOS, captures that process's main window through CoreGraphics. On
//! other platforms attachment works but capture reports
//! [`CaptureError::Unsupported`]; backups carry on without screenshots.

use crate::process::{self, ProcessInfo};
use crate::types::{AttachmentError, AttachmentHandle, CaptureError, ImageSize, Pid};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

/// Window position and size in global display coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowBounds {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Windows smaller than this are tooltips, popups or splash remnants
    pub fn is_substantial(&self) -> bool {
        self.width >= 100 && self.height >= 100
    }
}

#[cfg(target_os = "macos")]
mod window {
    use super::*;
    use core_foundation::array::CFArray;
    use core_foundation::base::{CFType, TCFType, TCFTypeRef};
    use core_foundation::boolean::CFBoolean;
    use core_foundation::dictionary::CFDictionary;
    use core_foundation::number::CFNumber;
    use core_foundation::string::CFString;
    use core_graphics::geometry::{CGPoint, CGRect, CGSize};
    use core_graphics::image::CGImage;
    use core_graphics::window::{
        kCGNullWindowID, kCGWindowImageBestResolution, kCGWindowImageBoundsIgnoreFraming,
        kCGWindowListExcludeDesktopElements, kCGWindowListOptionIncludingWindow,
        kCGWindowListOptionOnScreenOnly, CGWindowListCopyWindowInfo, CGWindowListCreateImage,
    };
    use foreign_types_shared::ForeignType;

    /// First normal, on-screen window owned by `pid` (front-to-back order)
    pub fn main_window(pid: Pid) -> Option<(u32, WindowBounds)> {
        let options = kCGWindowListOptionOnScreenOnly | kCGWindowListExcludeDesktopElements;

        let window_list: CFArray<WindowInfo> = unsafe {
            let list_ref = CGWindowListCopyWindowInfo(options, kCGNullWindowID);
            if list_ref.is_null() {
                return None;
            }
            CFArray::wrap_under_create_rule(list_ref)
        };

        for i in 0..window_list.len() {
            let dict = match window_list.get(i) {
                Some(d) => d,
                None => continue,
            };

            if int_field(&dict, "kCGWindowOwnerPID") != Some(pid as i64) {
                continue;
            }

            // Skip menu bars, docks, overlays
            if int_field(&dict, "kCGWindowLayer").unwrap_or(-1) != 0 {
                continue;
            }

            if !is_onscreen(&dict) {
                continue;
            }

            let window_id = match int_field(&dict, "kCGWindowNumber") {
                Some(id) => id as u32,
                None => continue,
            };

            if let Some(bounds) = window_bounds(&dict) {
                if bounds.is_substantial() {
                    return Some((window_id, bounds));
                }
            }
        }

        None
    }

    /// Capture a specific window by ID
    pub fn capture_window(window_id: u32, bounds: &WindowBounds) -> Option<RgbaImage> {
        let rect = CGRect::new(
            &CGPoint::new(bounds.x as f64, bounds.y as f64),
            &CGSize::new(bounds.width as f64, bounds.height as f64),
        );

        let options = kCGWindowImageBoundsIgnoreFraming | kCGWindowImageBestResolution;

        let cg_image: CGImage = unsafe {
            let image_ref = CGWindowListCreateImage(
                rect,
                kCGWindowListOptionIncludingWindow,
                window_id,
                options,
            );
            if image_ref.is_null() {
                return None;
            }
            CGImage::from_ptr(image_ref)
        };

        convert_cgimage_to_rgba(&cg_image)
    }

    /// Convert a BGRA CGImage to an RgbaImage
    fn convert_cgimage_to_rgba(cg_image: &CGImage) -> Option<RgbaImage> {
        let width = cg_image.width();
        let height = cg_image.height();
        let bytes_per_row = cg_image.bytes_per_row();
        let bytes_per_pixel = cg_image.bits_per_pixel() / 8;

        let data = cg_image.data();
        let bytes = data.bytes();

        if bytes.is_empty() || bytes_per_pixel < 4 {
            return None;
        }

        let mut rgba_data = Vec::with_capacity(width * height * 4);

        for y in 0..height {
            let row_start = y * bytes_per_row;
            for x in 0..width {
                let p = row_start + x * bytes_per_pixel;
                if p + 3 < bytes.len() {
                    rgba_data.extend_from_slice(&[bytes[p + 2], bytes[p + 1], bytes[p], bytes[p + 3]]);
                }
            }
        }

        RgbaImage::from_raw(width as u32, height as u32, rgba_data)
    }

    type WindowInfo = CFDictionary<CFString, CFType>;

    /// Value under `key` if present and of CF type `T`
    fn lookup<T: TCFType>(dict: &WindowInfo, key: &str) -> Option<T> {
        let value = dict.find(&CFString::new(key))?;
        if value.type_of() != T::type_id() {
            return None;
        }
        let raw = T::Ref::from_void_ptr(value.as_CFTypeRef());
        Some(unsafe { T::wrap_under_get_rule(raw) })
    }

    fn int_field(dict: &WindowInfo, key: &str) -> Option<i64> {
        lookup::<CFNumber>(dict, key)?.to_i64()
    }

    fn is_onscreen(dict: &WindowInfo) -> bool {
        const KEY: &str = "kCGWindowIsOnscreen";
        // Boolean on recent releases, a number on older ones
        if let Some(flag) = lookup::<CFBoolean>(dict, KEY) {
            return flag.into();
        }
        int_field(dict, KEY).map_or(false, |n| n != 0)
    }

    fn window_bounds(dict: &WindowInfo) -> Option<WindowBounds> {
        let rect = lookup::<WindowInfo>(dict, "kCGWindowBounds")?;
        let field = |key: &str| lookup::<CFNumber>(&rect, key).and_then(|n| n.to_f64());

        Some(WindowBounds::new(
            field("X")? as i32,
            field("Y")? as i32,
            field("Width")? as u32,
            field("Height")? as u32,
        ))
    }

}

#[cfg(not(target_os = "macos"))]
mod window {
    use super::*;

    /// Window lookup is unavailable; any matching process is accepted
    pub fn main_window(_pid: Pid) -> Option<(u32, WindowBounds)> {
        None
    }

    pub fn capture_window(_window_id: u32, _bounds: &WindowBounds) -> Option<RgbaImage> {
        None
    }
}

/// Capability to bind to the game process and grab screenshots from it.
///
/// Implementations bound their own blocking work; the tracker treats every
/// error here as non-fatal.
#[async_trait::async_trait]
pub trait CaptureGateway: Send + Sync {
    /// Bind to the first running process matching `executable`
    async fn attach(&self, executable: &str) -> Result<AttachmentHandle, AttachmentError>;

    /// Whether the bound process is still alive
    async fn is_attached(&self, handle: &AttachmentHandle) -> bool;

    /// Release a binding
    async fn detach(&self, handle: AttachmentHandle);

    /// Capture the game's current frame, resized to `target` when given
    async fn capture_screenshot(
        &self,
        handle: &AttachmentHandle,
        target: Option<ImageSize>,
    ) -> Result<DynamicImage, CaptureError>;
}

/// Default gateway backed by the platform process list and window capture
pub struct SystemCaptureGateway {
    capture_timeout: Duration,
    /// Pids currently bound through this gateway
    attached: Mutex<HashSet<Pid>>,
}

impl SystemCaptureGateway {
    pub fn new(capture_timeout: Duration) -> Self {
        Self {
            capture_timeout,
            attached: Mutex::new(HashSet::new()),
        }
    }

    fn is_bound(&self, pid: Pid) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pid)
    }

    async fn processes() -> Result<Vec<ProcessInfo>, AttachmentError> {
        tokio::task::spawn_blocking(process::list_processes)
            .await
            .map_err(|e| AttachmentError::Failed(format!("process enumeration panicked: {}", e)))?
            .map_err(AttachmentError::from)
    }
}

impl Default for SystemCaptureGateway {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait::async_trait]
impl CaptureGateway for SystemCaptureGateway {
    async fn attach(&self, executable: &str) -> Result<AttachmentHandle, AttachmentError> {
        let processes = Self::processes().await?;

        for candidate in process::find_by_executable(&processes, executable) {
            if self.is_bound(candidate.pid) {
                trace!("Process {} already attached, skipping", candidate.pid);
                continue;
            }

            // The game needs a window before it can be captured
            if cfg!(target_os = "macos") && window::main_window(candidate.pid).is_none() {
                debug!("Process {} has no window yet, skipping", candidate.pid);
                continue;
            }

            self.attached
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(candidate.pid);

            debug!("Bound to {} (pid {})", candidate.executable, candidate.pid);
            return Ok(AttachmentHandle::new(candidate.pid, candidate.executable.clone()));
        }

        Err(AttachmentError::NoMatchingProcess(executable.to_string()))
    }

    async fn is_attached(&self, handle: &AttachmentHandle) -> bool {
        if !self.is_bound(handle.pid) {
            return false;
        }

        match Self::processes().await {
            Ok(processes) => processes.iter().any(|p| p.pid == handle.pid),
            Err(e) => {
                // Cannot tell; keep the binding rather than flap
                debug!("Liveness check for pid {} failed: {}", handle.pid, e);
                true
            }
        }
    }

    async fn detach(&self, handle: AttachmentHandle) {
        let removed = self
            .attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.pid);

        if removed {
            debug!("Released {} (pid {})", handle.executable, handle.pid);
        }
    }

    async fn capture_screenshot(
        &self,
        handle: &AttachmentHandle,
        target: Option<ImageSize>,
    ) -> Result<DynamicImage, CaptureError> {
        if !cfg!(target_os = "macos") {
            return Err(CaptureError::Unsupported);
        }

        let pid = handle.pid;
        let grab = tokio::task::spawn_blocking(move || {
            let (window_id, bounds) = window::main_window(pid)?;
            trace!("Capturing window {} of pid {} at {:?}", window_id, pid, bounds);
            window::capture_window(window_id, &bounds)
        });

        let captured = tokio::time::timeout(self.capture_timeout, grab)
            .await
            .map_err(|_| CaptureError::Timeout(self.capture_timeout))?
            .map_err(|e| CaptureError::Failed(format!("capture task panicked: {}", e)))?;

        let image = DynamicImage::ImageRgba8(captured.ok_or(CaptureError::NoImage)?);
        Ok(fit_to(image, target))
    }
}

/// Resize to exactly `target`, if one is set
pub fn fit_to(image: DynamicImage, target: Option<ImageSize>) -> DynamicImage {
    match target {
        Some(size) if size.width != image.width() || size.height != image.height() => {
            image.resize_exact(size.width, size.height, image::imageops::FilterType::Triangle)
        }
        _ => image,
    }
}

/// Write a screenshot as JPEG. Alpha is dropped since JPEG cannot carry it.
pub fn save_screenshot(image: &DynamicImage, path: &Path) -> Result<(), CaptureError> {
    let start = std::time::Instant::now();
    DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(path, ImageFormat::Jpeg)?;
    debug!("Screenshot written to {:?} in {:?}", path, start.elapsed());
    Ok(())
}

#[cfg(test)]
pub mod mock {
    //! Scriptable gateway for exercising the tracker without a game.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub const MOCK_PID: Pid = 4242;

    #[derive(Default)]
    pub struct MockGateway {
        /// Whether the game process "exists"
        pub running: AtomicBool,
        /// Report attach failures as hard errors instead of "not found"
        pub fail_hard: AtomicBool,
        /// Whether screenshots succeed
        pub capture_ok: AtomicBool,
        /// Make capture hang until the caller gives up
        pub capture_stall: AtomicBool,
        pub attach_calls: AtomicUsize,
        pub detach_calls: AtomicUsize,
        pub capture_calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn running() -> Self {
            let gateway = Self::new();
            gateway.running.store(true, Ordering::SeqCst);
            gateway.capture_ok.store(true, Ordering::SeqCst);
            gateway
        }

        pub fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        pub fn max_active(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }

        pub fn attach_calls(&self) -> usize {
            self.attach_calls.load(Ordering::SeqCst)
        }

        pub fn detach_calls(&self) -> usize {
            self.detach_calls.load(Ordering::SeqCst)
        }

        pub fn capture_calls(&self) -> usize {
            self.capture_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CaptureGateway for MockGateway {
        async fn attach(&self, executable: &str) -> Result<AttachmentHandle, AttachmentError> {
            self.attach_calls.fetch_add(1, Ordering::SeqCst);

            if !self.running.load(Ordering::SeqCst) {
                if self.fail_hard.load(Ordering::SeqCst) {
                    return Err(AttachmentError::Failed("injection refused".into()));
                }
                return Err(AttachmentError::NoMatchingProcess(executable.to_string()));
            }

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            Ok(AttachmentHandle::new(MOCK_PID, executable))
        }

        async fn is_attached(&self, _handle: &AttachmentHandle) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn detach(&self, _handle: AttachmentHandle) {
            self.detach_calls.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        async fn capture_screenshot(
            &self,
            _handle: &AttachmentHandle,
            target: Option<ImageSize>,
        ) -> Result<DynamicImage, CaptureError> {
            self.capture_calls.fetch_add(1, Ordering::SeqCst);

            if self.capture_stall.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if !self.capture_ok.load(Ordering::SeqCst) {
                return Err(CaptureError::Failed("device lost".into()));
            }
            Ok(fit_to(DynamicImage::new_rgba8(32, 16), target))
        }
    }
}
