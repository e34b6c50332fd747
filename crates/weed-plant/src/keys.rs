//! Well-known leaf names shared between the host and plugins.

pub const TYPE: &str = "type";
pub const FLAGS: &str = "flags";

// plugin info
pub const FILTERS: &str = "filters";
pub const HOST_INFO: &str = "host_info";
pub const VERSION: &str = "version";
pub const PACKAGE_NAME: &str = "package_name";
pub const PLUGIN_INFO: &str = "plugin_info";
pub const HANDLE: &str = "handle";

// host info
pub const WEED_API_VERSION: &str = "weed_api_version";
pub const FILTER_API_VERSION: &str = "filter_api_version";
pub const HOST_ID: &str = "host_id";
pub const HOST_NAME: &str = "host_name";
pub const HOST_VERSION: &str = "host_version";
pub const GET_FUNC: &str = "weed_leaf_get_func";
pub const SET_FUNC: &str = "weed_leaf_set_func";
pub const DELETE_FUNC: &str = "weed_leaf_delete_func";
pub const PLANT_NEW_FUNC: &str = "weed_plant_new_func";
pub const PLANT_FREE_FUNC: &str = "weed_plant_free_func";
pub const LIST_LEAVES_FUNC: &str = "weed_plant_list_leaves_func";
pub const NUM_ELEMENTS_FUNC: &str = "weed_leaf_num_elements_func";
pub const ELEMENT_SIZE_FUNC: &str = "weed_leaf_element_size_func";
pub const SEED_TYPE_FUNC: &str = "weed_leaf_seed_type_func";
pub const GET_FLAGS_FUNC: &str = "weed_leaf_get_flags_func";
pub const SET_FLAGS_FUNC: &str = "weed_leaf_set_flags_func";
pub const MALLOC_FUNC: &str = "weed_malloc_func";
pub const FREE_FUNC: &str = "weed_free_func";
pub const MEMSET_FUNC: &str = "weed_memset_func";
pub const MEMCPY_FUNC: &str = "weed_memcpy_func";

// filter class
pub const NAME: &str = "name";
pub const AUTHOR: &str = "author";
pub const PALETTE_LIST: &str = "palette_list";
pub const INIT_FUNC: &str = "init_func";
pub const DEINIT_FUNC: &str = "deinit_func";
pub const PROCESS_FUNC: &str = "process_func";
pub const IN_CHANNEL_TEMPLATES: &str = "in_chan_tmpls";
pub const OUT_CHANNEL_TEMPLATES: &str = "out_chan_tmpls";
pub const IN_PARAMETER_TEMPLATES: &str = "in_param_tmpls";
pub const OUT_PARAMETER_TEMPLATES: &str = "out_param_tmpls";
pub const TARGET_FPS: &str = "target_fps";
pub const HSTEP: &str = "hstep";
pub const VSTEP: &str = "vstep";
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
pub const MAXWIDTH: &str = "maxwidth";
pub const MAXHEIGHT: &str = "maxheight";
pub const MINWIDTH: &str = "minwidth";
pub const MINHEIGHT: &str = "minheight";
pub const FIXED_WIDTHS: &str = "widths";
pub const FIXED_HEIGHTS: &str = "heights";
pub const ALIGNMENT: &str = "alignment";
pub const AUDIO_RATE: &str = "audio_rate";
pub const MAX_AUDIO_CHANNELS: &str = "max_audio_chans";

// channel template / channel
pub const IS_AUDIO: &str = "is_audio";
pub const MAX_REPEATS: &str = "max_repeats";
pub const TEMPLATE: &str = "template";
pub const PIXEL_DATA: &str = "pixel_data";
pub const CURRENT_PALETTE: &str = "current_palette";
pub const ROWSTRIDES: &str = "rowstrides";
pub const AUDIO_DATA: &str = "audio_data";
pub const AUDIO_DATA_LENGTH: &str = "audio_data_len";
pub const AUDIO_CHANNELS: &str = "audio_channels";
pub const OFFSET: &str = "offset";
pub const DISABLED: &str = "disabled";
pub const TIMECODE: &str = "timecode";
pub const INPLACE: &str = "inplace";
pub const YUV_CLAMPING: &str = "YUV_clamping";
pub const YUV_SAMPLING: &str = "YUV_sampling";
pub const YUV_SUBSPACE: &str = "YUV_subspace";

// parameter template / parameter
pub const DEFAULT: &str = "default";
pub const MIN: &str = "min";
pub const MAX: &str = "max";
pub const PARAM_TYPE: &str = "param_type";
pub const NEW_DEFAULT: &str = "new_default";
pub const COLORSPACE: &str = "colorspace";
pub const GUI: &str = "gui";
pub const CHOICES: &str = "choices";
pub const HIDDEN: &str = "hidden";
pub const VALUE: &str = "value";

// filter instance
pub const FILTER_CLASS: &str = "filter_class";
pub const IN_PARAMETERS: &str = "in_parameters";
pub const OUT_PARAMETERS: &str = "out_parameters";
pub const IN_CHANNELS: &str = "in_channels";
pub const OUT_CHANNELS: &str = "out_channels";
pub const FPS: &str = "fps";
pub const EASE_IN: &str = "ease_in";
pub const EASE_OUT: &str = "ease_out";

// host bookkeeping
pub const HOST_DEFAULT: &str = "host_default";
pub const HOST_WIDTH: &str = "host_width";
pub const HOST_HEIGHT: &str = "host_height";
pub const HOST_FPS: &str = "host_fps";
pub const HOST_DISABLED: &str = "host_disabled";
pub const TEMP_DISABLED: &str = "temp_disabled";
pub const RANDOM_SEED: &str = "random_seed";
pub const STATE_UPDATED: &str = "state_updated";
pub const HOST_MENU_HIDE: &str = "host_menu_hide";
pub const HOST_SUSPICIOUS: &str = "host_suspicious";

// layers
pub const CLIP: &str = "clip";
pub const FRAME: &str = "frame";
