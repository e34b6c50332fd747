#![no_main]

use libfuzzer_sys::fuzz_target;
use weed_plant::serialize::fuzz_deserialize;

fuzz_target!(|data: &[u8]| {
    fuzz_deserialize(data);
});
