//! Bit and enum values plugins put in `flags` and `param_type` leaves.

// filter class flags
pub const FILTER_NON_REALTIME: i32 = 1 << 0;
pub const FILTER_IS_CONVERTER: i32 = 1 << 1;
pub const FILTER_HINT_STATELESS: i32 = 1 << 2;
pub const FILTER_PREF_LINEAR_GAMMA: i32 = 1 << 3;
pub const FILTER_PREF_PREMULTIPLIED_ALPHA: i32 = 1 << 4;
pub const FILTER_PROCESS_LAST: i32 = 1 << 5;
pub const FILTER_HINT_MAY_THREAD: i32 = 1 << 6;
pub const FILTER_HINT_MAYBE_UNSTABLE: i32 = 1 << 7;
pub const FILTER_CHANNEL_SIZES_MAY_VARY: i32 = 1 << 8;
pub const FILTER_PALETTES_MAY_VARY: i32 = 1 << 9;
pub const FILTER_CHANNEL_LAYOUTS_MAY_VARY: i32 = 1 << 15;
pub const FILTER_AUDIO_RATES_MAY_VARY: i32 = 1 << 16;

// channel template flags
pub const CHANNEL_REINIT_ON_SIZE_CHANGE: i32 = 1 << 0;
pub const CHANNEL_REINIT_ON_PALETTE_CHANGE: i32 = 1 << 1;
pub const CHANNEL_REINIT_ON_ROWSTRIDES_CHANGE: i32 = 1 << 2;
pub const CHANNEL_OPTIONAL: i32 = 1 << 3;
pub const CHANNEL_CAN_DO_INPLACE: i32 = 1 << 4;
pub const CHANNEL_NEEDS_NATURAL_SIZE: i32 = 1 << 5;

// parameter template flags
pub const PARAM_REINIT_ON_VALUE_CHANGE: i32 = 1 << 0;
pub const PARAM_VARIABLE_SIZE: i32 = 1 << 1;
pub const PARAM_VALUE_PER_CHANNEL: i32 = 1 << 2;
pub const PARAM_VALUE_IRRELEVANT: i32 = 1 << 3;

// parameter types
pub const PARAM_INTEGER: i32 = 1;
pub const PARAM_FLOAT: i32 = 2;
pub const PARAM_TEXT: i32 = 3;
pub const PARAM_SWITCH: i32 = 4;
pub const PARAM_COLOR: i32 = 5;

// colorspaces
pub const COLORSPACE_RGB: i32 = 1;
pub const COLORSPACE_RGBA: i32 = 2;
