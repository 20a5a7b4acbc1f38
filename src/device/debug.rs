//! Routes vulkan debug utils messages into the logger.

use std::ffi::{c_void, CStr};
use std::fmt::Write;

use ash::vk;

/// Receives validation and debug utils messages.
pub trait DebugMessengerCallback: Send + Sync {
    fn on_message(
        &self,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
        message_types: vk::DebugUtilsMessageTypeFlagsEXT,
        data: &vk::DebugUtilsMessengerCallbackDataEXT,
    );
}

/// Forwards debug utils messages to the [`log`] macros, expanding the label
/// and object tables the way the validation layers attach them.
pub struct RustLogDebugMessenger {
}

impl RustLogDebugMessenger {
    pub fn new() -> Self {
        Self {
        }
    }

    fn format_message(data: &vk::DebugUtilsMessengerCallbackDataEXT) -> String {
        let mut message = String::new();

        let id_name = if data.p_message_id_name.is_null() {
            "<unknown>"
        } else {
            unsafe { CStr::from_ptr(data.p_message_id_name) }.to_str().unwrap_or("<invalid>")
        };
        let text = if data.p_message.is_null() {
            "<empty>"
        } else {
            unsafe { CStr::from_ptr(data.p_message) }.to_str().unwrap_or("<invalid>")
        };

        let _ = write!(message, "[{} ({})] {}", id_name, data.message_id_number, text);

        if data.queue_label_count > 0 && !data.p_queue_labels.is_null() {
            let labels = unsafe {
                std::slice::from_raw_parts(data.p_queue_labels, data.queue_label_count as usize)
            };
            let _ = write!(message, "\n\tqueue labels:");
            for label in labels {
                if !label.p_label_name.is_null() {
                    let name = unsafe { CStr::from_ptr(label.p_label_name) };
                    let _ = write!(message, " <{:?}>", name);
                }
            }
        }

        if data.cmd_buf_label_count > 0 && !data.p_cmd_buf_labels.is_null() {
            let labels = unsafe {
                std::slice::from_raw_parts(data.p_cmd_buf_labels, data.cmd_buf_label_count as usize)
            };
            let _ = write!(message, "\n\tcommand buffer labels:");
            for label in labels {
                if !label.p_label_name.is_null() {
                    let name = unsafe { CStr::from_ptr(label.p_label_name) };
                    let _ = write!(message, " <{:?}>", name);
                }
            }
        }

        if data.object_count > 0 && !data.p_objects.is_null() {
            let objects = unsafe {
                std::slice::from_raw_parts(data.p_objects, data.object_count as usize)
            };
            for (index, object) in objects.iter().enumerate() {
                let _ = write!(
                    message,
                    "\n\tobject {}: type: {:?}, handle: {:#x}",
                    index, object.object_type, object.object_handle
                );
                if !object.p_object_name.is_null() {
                    let name = unsafe { CStr::from_ptr(object.p_object_name) };
                    let _ = write!(message, ", name: <{:?}>", name);
                }
            }
        }

        message
    }
}

impl DebugMessengerCallback for RustLogDebugMessenger {
    fn on_message(
        &self,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
        _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
        data: &vk::DebugUtilsMessengerCallbackDataEXT,
    ) {
        let message = Self::format_message(data);

        if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            log::error!("{}", message);
        } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            log::warn!("{}", message);
        } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            log::info!("{}", message);
        } else {
            log::trace!("{}", message);
        }
    }
}

/// Keeps the boxed callback alive for the lifetime of the messenger. The
/// instance holds a pointer to this wrapper as the callback user data.
pub(crate) struct DebugUtilsMessengerWrapper {
    pub(crate) callback: Box<dyn DebugMessengerCallback>,
}

pub(crate) extern "system" fn debug_utils_messenger_callback_wrapper(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    // This is called by c code so we must catch any panics.
    std::panic::catch_unwind(|| {
        if let Some(wrapper) = unsafe { (p_user_data as *const DebugUtilsMessengerWrapper).as_ref() } {
            let data = unsafe {
                p_callback_data.as_ref().unwrap_or_else(|| std::process::abort())
            };
            wrapper.callback.on_message(message_severity, message_types, data);
        } else {
            log::warn!("debug utils messenger was called with null user data");
        }
    }).unwrap_or_else(|_| {
        log::error!("debug utils messenger callback panicked, aborting");
        std::process::exit(1);
    });

    vk::FALSE
}
