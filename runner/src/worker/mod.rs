mod completion;
mod reaper;
mod region_processor;
mod results;
mod scheduler;
mod tile_worker;

pub use completion::{
    complete_image, fail_image, finalize_tile, maybe_finish_region, persist_tile_features,
};
pub use reaper::{run_reaper, sweep};
pub use region_processor::{handle_region_message, run_region_loop};
pub use results::{TileResultEvent, handle_result_message, parse_result_event, run_results_loop};
pub use scheduler::{handle_image_message, run_image_loop};
pub use tile_worker::{TileWork, run_pool};
