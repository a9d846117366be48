//! Narrative definitions. `telemarketopia` is the bundled sample story;
//! additional narratives register their own `Script`/`SharedState` pairs
//! the same way.

mod telemarketopia;

pub use telemarketopia::{
    build_script, record_conference_leave, record_conference_start, ConferenceTextHandler,
    DestroyTelemarketopia, FinalPuzzleDeps, GreetingRoom, MakeClimaxCallsTask, PathIntakeRoom,
    PleaseWaitRoom, SendFinalFinalResult, TelemarketopiaAssets, TelemarketopiaState, IN_FINAL_FINAL_KEY,
    PATH_CLAVAE, PATH_KAREN, SCRIPT_NAME,
};
