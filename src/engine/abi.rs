//! Purpose: C ABI surface of the engine (types, constants, functions).
//! Exports: `VxObject`, `VxValue`, `VxBuf`, `VxArgumentInfo`, callback typedefs, `vx_*`.
//! Role: The only path into the engine; mirrors a system library header.
//! Invariants: Handles are opaque; every `*_new` returns one owned reference.
//! Invariants: Strings returned as `*mut c_char` are freed with `vx_free_string`.
//! Invariants: Buffers returned as `VxBuf` are freed with `vx_buf_free`.
use std::os::raw::{c_char, c_int, c_void};

pub use super::object::VxObject;
pub use super::value::{VxValue, VxValueData};

pub use super::blob::{vx_blob_copy, vx_blob_get, vx_blob_new};
pub use super::diag::{
    vx_buf_free, vx_error_buffer_copy, vx_error_clear, vx_free_string, vx_log_remove_handler,
    vx_log_set_handler,
};
pub use super::image::{
    vx_image_copy_memory, vx_image_get_bands, vx_image_get_filename, vx_image_get_format,
    vx_image_get_height, vx_image_get_width, vx_image_get_xres, vx_image_get_yres,
    vx_image_new_from_memory, vx_image_new_from_memory_copy, vx_image_new_matrix_from_array,
    vx_image_write_to_memory,
};
pub use super::lifecycle::{
    vx_concurrency_get, vx_concurrency_set, vx_init, vx_leak_set, vx_object_live_count,
    vx_shutdown, vx_version_string,
};
pub use super::object::{
    vx_object_ref, vx_object_refcount, vx_object_type_name, vx_object_unref,
    vx_signal_handler_disconnect,
};
pub use super::ppm::{
    vx_foreign_find_load, vx_foreign_find_load_buffer, vx_foreign_find_load_source,
    vx_foreign_find_save, vx_foreign_find_save_buffer, vx_foreign_find_save_target,
};
pub use super::registry::{
    vx_object_get_property, vx_object_set_from_string, vx_object_set_property,
    vx_object_unref_outputs, vx_operation_build, vx_operation_class_count,
    vx_operation_class_nickname, vx_operation_get_arg, vx_operation_get_description,
    vx_operation_n_args, vx_operation_new,
};
pub use super::source::{
    vx_source_custom_connect_read, vx_source_custom_connect_seek, vx_source_custom_new,
    vx_source_decode, vx_source_filename, vx_source_is_file, vx_source_is_mappable,
    vx_source_length, vx_source_map, vx_source_new_from_blob, vx_source_new_from_descriptor,
    vx_source_new_from_file, vx_source_new_from_memory, vx_source_read, vx_source_rewind,
    vx_source_seek, vx_source_sniff,
};
pub use super::target::{
    vx_target_custom_connect_end, vx_target_custom_connect_finish, vx_target_custom_connect_read,
    vx_target_custom_connect_seek, vx_target_custom_connect_write, vx_target_custom_new,
    vx_target_end, vx_target_is_ended, vx_target_is_memory, vx_target_new_to_descriptor,
    vx_target_new_to_file, vx_target_new_to_memory, vx_target_putc, vx_target_read,
    vx_target_seek, vx_target_steal, vx_target_write, vx_target_writes,
};
pub use super::value::{
    vx_type_name, vx_value_get_array_double, vx_value_get_array_image, vx_value_get_array_int,
    vx_value_get_boolean, vx_value_get_double, vx_value_get_enum, vx_value_get_int,
    vx_value_get_object, vx_value_get_string, vx_value_init, vx_value_set_array_double,
    vx_value_set_array_image, vx_value_set_array_int, vx_value_set_boolean, vx_value_set_double,
    vx_value_set_enum, vx_value_set_int, vx_value_set_object, vx_value_set_string,
    vx_value_unset,
};

pub type VxType = u32;

pub const VX_TYPE_NONE: VxType = 0;
pub const VX_TYPE_BOOLEAN: VxType = 1;
pub const VX_TYPE_INT: VxType = 2;
pub const VX_TYPE_DOUBLE: VxType = 3;
pub const VX_TYPE_STRING: VxType = 4;
pub const VX_TYPE_ARRAY_DOUBLE: VxType = 6;
pub const VX_TYPE_ARRAY_INT: VxType = 7;
pub const VX_TYPE_ARRAY_IMAGE: VxType = 8;
pub const VX_TYPE_IMAGE: VxType = 9;
pub const VX_TYPE_BLOB: VxType = 10;
pub const VX_TYPE_SOURCE: VxType = 11;
pub const VX_TYPE_TARGET: VxType = 12;
/// First enum type id; every id at or above this holds an enum constant.
pub const VX_TYPE_ENUM_BASE: VxType = 20;
pub const VX_TYPE_DIRECTION: VxType = 20;
pub const VX_TYPE_BAND_FORMAT: VxType = 21;

pub const VX_ARGUMENT_REQUIRED: u32 = 1 << 0;
pub const VX_ARGUMENT_INPUT: u32 = 1 << 1;
pub const VX_ARGUMENT_OUTPUT: u32 = 1 << 2;

pub const VX_LOG_LEVEL_ERROR: u32 = 1 << 2;
pub const VX_LOG_LEVEL_CRITICAL: u32 = 1 << 3;
pub const VX_LOG_LEVEL_WARNING: u32 = 1 << 4;
pub const VX_LOG_LEVEL_MESSAGE: u32 = 1 << 5;
pub const VX_LOG_LEVEL_INFO: u32 = 1 << 6;
pub const VX_LOG_LEVEL_DEBUG: u32 = 1 << 7;

/// Property lookup results for `vx_object_set_property`/`vx_object_get_property`.
pub const VX_PROPERTY_OK: c_int = 0;
pub const VX_PROPERTY_UNKNOWN: c_int = -1;
pub const VX_PROPERTY_TYPE_MISMATCH: c_int = -2;
pub const VX_PROPERTY_UNSET: c_int = -3;

#[repr(C)]
pub struct VxBuf {
    pub data: *mut u8,
    pub len: usize,
}

#[repr(C)]
pub struct VxArgumentInfo {
    pub name: *const c_char,
    pub description: *const c_char,
    pub ty: VxType,
    pub flags: u32,
    pub priority: c_int,
}

pub type VxDestroyNotify = unsafe extern "C" fn(user: *mut c_void);
pub type VxFreeFn = unsafe extern "C" fn(data: *mut c_void, user: *mut c_void);
pub type VxLogFn =
    unsafe extern "C" fn(domain: *const c_char, level: u32, message: *const c_char, user: *mut c_void);

pub type VxReadFn =
    unsafe extern "C" fn(object: *mut VxObject, buf: *mut c_void, len: i64, user: *mut c_void) -> i64;
pub type VxSeekFn =
    unsafe extern "C" fn(object: *mut VxObject, offset: i64, whence: c_int, user: *mut c_void) -> i64;
pub type VxWriteFn = unsafe extern "C" fn(
    object: *mut VxObject,
    data: *const c_void,
    len: i64,
    user: *mut c_void,
) -> i64;
pub type VxEndFn = unsafe extern "C" fn(object: *mut VxObject, user: *mut c_void) -> c_int;
pub type VxFinishFn = unsafe extern "C" fn(object: *mut VxObject, user: *mut c_void);
