// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot orchestrator: wires the decision engine to a board and acts on the
//! outcome.
//!
//! A board integration implements [`Board`], constructs a [`Bootloader`]
//! with its retained tap register (if it has one) and a [`BootConfig`], and
//! calls [`Bootloader::run`] from its reset path:
//!
//! ```ignore
//! let scratch = unsafe { RetainedCell::at(RTC_BKP0R) };
//! Bootloader::new(board, Some(scratch), BootConfig::DEFAULT).run()
//! ```
//!
//! `run` never returns: it either transfers control to the application or
//! falls into the board's update-mode event loop. The board's periodic
//! timer interrupt must increment [`TICKS`] while it is running; that
//! counter is how the decision engine sees time during the double-tap
//! window.
//!
//! Everything hardware-specific stays behind [`Board`]: clock and pin
//! bring-up, image validity checks, flash erase, the USB/UF2 update stack,
//! and the jump itself. On Cortex-M targets the `arch` module supplies the
//! vector-table handoff most `jump_to_application` implementations want.

#![cfg_attr(not(test), no_std)]

#[cfg(all(target_os = "none", feature = "panic-halt"))]
use panic_halt as _;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod arch;

use bootmode::{decide, AppValidity, BootMode, TickCounter, Ticker};
use ringlog::{ringlog, ringlog_entry};
use tapreg::TapRegister;

pub use bootmode::TapWindow;

/// Build-time configuration, assembled as consts by the board integration.
#[derive(Copy, Clone, Debug)]
pub struct BootConfig {
    /// Double-tap window parameters, or `None` to disable detection.
    pub double_tap: Option<TapWindow>,
    /// Engage write protection over the bootloader's own flash region
    /// before anything else can run.
    pub protect_bootloader: bool,
}

impl BootConfig {
    pub const DEFAULT: Self = Self {
        double_tap: Some(TapWindow::DEFAULT),
        protect_bootloader: false,
    };
}

/// Capability interface onto the board support package.
///
/// The hooks with default bodies are optional collaborators: a board that
/// has no second init phase, no secondary validity check, or no flash
/// protection simply leaves them alone.
pub trait Board {
    /// Brings up the minimum the decision pass needs: clocks, the retained
    /// register's power domain, the timer peripheral.
    fn init(&mut self);

    /// Second init phase for boards that split bring-up.
    fn init_secondary(&mut self) {}

    /// Whether the flashed application image is bootable.
    fn app_valid(&mut self) -> bool;

    /// Independent second validity check, if the board has one.
    fn app_valid_secondary(&mut self) -> Option<bool> {
        None
    }

    /// Write-protects (or unprotects) the bootloader's flash region.
    fn protect_bootloader(&mut self, _enable: bool) {}

    /// Starts the periodic timer whose interrupt increments [`TICKS`].
    fn timer_start(&mut self, period_ms: u32);

    /// Stops the periodic timer.
    fn timer_stop(&mut self);

    /// Undoes whatever `init` did that the application must not inherit.
    /// Best effort.
    fn teardown(&mut self) {}

    /// Counterpart of `init_secondary`.
    fn teardown_secondary(&mut self) {}

    /// Transfers control to the application image. Does not return on
    /// success. Returning at all reports failure; the orchestrator treats
    /// it as fatal.
    fn jump_to_application(&mut self);

    /// Erases the application image, synchronously.
    fn erase_application(&mut self);

    /// Initializes the update-mode stack (UF2 core, USB device) and runs
    /// its event loop. Never returns.
    fn enter_update_mode(&mut self) -> !;
}

/// Tick count for the decision window.
///
/// The board's periodic timer interrupt handler is the counter's only
/// writer:
///
/// ```ignore
/// #[interrupt]
/// fn TIM2() { waypoint::TICKS.increment(); }
/// ```
pub static TICKS: TickCounter = TickCounter::new();

/// Presents the board timer plus [`TICKS`] to the engine as one tick
/// source.
struct BoardTicker<'a, B: Board> {
    board: &'a mut B,
    counter: &'a TickCounter,
}

impl<B: Board> Ticker for BoardTicker<'_, B> {
    fn start(&mut self, period_ms: u32) {
        // Reset first: no tick from an earlier use of the timer may count
        // toward the new window.
        self.counter.reset();
        self.board.timer_start(period_ms);
    }

    fn stop(&mut self) {
        self.board.timer_stop();
    }

    fn ticks(&self) -> u32 {
        self.counter.read()
    }
}

/// Orchestrator trace, read from a debugger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    None,
    Start,
    JumpToApplication,
    /// The application entry point handed control back. Fatal.
    JumpReturned,
    EraseApplication,
    UpdateMode,
}

ringlog!(Event, 8, Event::None);

/// The bootloader: a board, its optional retained tap register, and the
/// build-time configuration.
pub struct Bootloader<B: Board, R: TapRegister> {
    board: B,
    scratch: Option<R>,
    config: BootConfig,
}

impl<B: Board, R: TapRegister> Bootloader<B, R> {
    pub fn new(board: B, scratch: Option<R>, config: BootConfig) -> Self {
        Self {
            board,
            scratch,
            config,
        }
    }

    /// Runs one boot pass to its terminal state: the application, or the
    /// update-mode event loop.
    pub fn run(mut self) -> ! {
        self.board.init();
        self.board.init_secondary();
        ringlog_entry!(Event::Start);

        if self.config.protect_bootloader {
            self.board.protect_bootloader(true);
        }

        // Validity is re-queried every pass, never cached across boots.
        let app = AppValidity {
            primary: self.board.app_valid(),
            secondary: self.board.app_valid_secondary(),
        };

        let mode = {
            let mut ticker = BoardTicker {
                board: &mut self.board,
                counter: &TICKS,
            };
            decide(
                app,
                self.scratch.as_mut(),
                &mut ticker,
                self.config.double_tap,
            )
        };

        match mode {
            BootMode::Application => {
                ringlog_entry!(Event::JumpToApplication);
                self.board.teardown();
                self.board.teardown_secondary();
                self.board.jump_to_application();

                // The application image failed to take over execution, and
                // it may have partially started: there is no state left
                // that is safe to continue from.
                ringlog_entry!(Event::JumpReturned);
                panic!("application did not take control");
            }
            BootMode::Update | BootMode::EraseThenUpdate => {
                if mode == BootMode::EraseThenUpdate {
                    // Erase strictly before the update stack comes up, so a
                    // reset from here on fails the validity check instead
                    // of booting a half-erased image.
                    ringlog_entry!(Event::EraseApplication);
                    self.board.erase_application();
                }
                ringlog_entry!(Event::UpdateMode);
                self.board.enter_update_mode()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use tapreg::{Signal, TAP_PENDING_MAGIC};

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Call {
        Init,
        InitSecondary,
        Protect,
        TimerStart,
        TimerStop,
        Teardown,
        TeardownSecondary,
        Jump,
        Erase,
        Update,
    }

    /// Board double that records its call sequence. The diverging
    /// capabilities (`jump_to_application` on success, `enter_update_mode`)
    /// panic with marker strings; tests catch the unwind and match on the
    /// marker.
    struct MockBoard {
        log: Arc<Mutex<Vec<Call>>>,
        app_valid: bool,
        app_valid_secondary: Option<bool>,
        /// If false, `jump_to_application` returns, simulating an image
        /// that never took over.
        jump_succeeds: bool,
        /// If true, `timer_start` spawns a thread that plays the timer
        /// interrupt, incrementing [`TICKS`] until well past any window
        /// used in these tests.
        drive_ticks: bool,
    }

    impl MockBoard {
        fn valid_app() -> (Self, Arc<Mutex<Vec<Call>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let board = Self {
                log: Arc::clone(&log),
                app_valid: true,
                app_valid_secondary: None,
                jump_succeeds: true,
                drive_ticks: false,
            };
            (board, log)
        }

        fn record(&self, call: Call) {
            self.log.lock().unwrap().push(call);
        }
    }

    impl Board for MockBoard {
        fn init(&mut self) {
            self.record(Call::Init);
        }
        fn init_secondary(&mut self) {
            self.record(Call::InitSecondary);
        }
        fn app_valid(&mut self) -> bool {
            self.app_valid
        }
        fn app_valid_secondary(&mut self) -> Option<bool> {
            self.app_valid_secondary
        }
        fn protect_bootloader(&mut self, _enable: bool) {
            self.record(Call::Protect);
        }
        fn timer_start(&mut self, _period_ms: u32) {
            self.record(Call::TimerStart);
            if self.drive_ticks {
                thread::spawn(|| {
                    for _ in 0..10_000 {
                        TICKS.increment();
                    }
                });
            }
        }
        fn timer_stop(&mut self) {
            self.record(Call::TimerStop);
        }
        fn teardown(&mut self) {
            self.record(Call::Teardown);
        }
        fn teardown_secondary(&mut self) {
            self.record(Call::TeardownSecondary);
        }
        fn jump_to_application(&mut self) {
            self.record(Call::Jump);
            if self.jump_succeeds {
                panic!("entered application");
            }
        }
        fn erase_application(&mut self) {
            self.record(Call::Erase);
        }
        fn enter_update_mode(&mut self) -> ! {
            self.record(Call::Update);
            panic!("entered update mode");
        }
    }

    /// Shared-handle register double so tests can inspect the word after
    /// `run` has consumed the `Bootloader`.
    #[derive(Clone)]
    struct SharedReg {
        state: Arc<Mutex<(u32, Vec<u32>)>>,
    }

    impl SharedReg {
        fn holding(signal: Signal) -> Self {
            Self {
                state: Arc::new(Mutex::new((signal.raw(), Vec::new()))),
            }
        }
        fn value(&self) -> u32 {
            self.state.lock().unwrap().0
        }
        fn writes(&self) -> Vec<u32> {
            self.state.lock().unwrap().1.clone()
        }
    }

    impl TapRegister for SharedReg {
        fn load(&mut self) -> u32 {
            self.state.lock().unwrap().0
        }
        fn store(&mut self, raw: u32) {
            let mut state = self.state.lock().unwrap();
            state.0 = raw;
            state.1.push(raw);
        }
    }

    fn run_to_panic<B: Board, R: TapRegister>(
        bootloader: Bootloader<B, R>,
    ) -> &'static str {
        let outcome =
            catch_unwind(AssertUnwindSafe(move || bootloader.run()));
        let payload = outcome.expect_err("run cannot return");
        *payload
            .downcast_ref::<&'static str>()
            .expect("marker panics carry a &str payload")
    }

    const NO_DETECTION: BootConfig = BootConfig {
        double_tap: None,
        protect_bootloader: false,
    };

    #[test]
    fn valid_app_with_detection_disabled_jumps() {
        let (board, log) = MockBoard::valid_app();
        let bootloader =
            Bootloader::<_, SharedReg>::new(board, None, NO_DETECTION);

        let marker = run_to_panic(bootloader);

        assert_eq!(marker, "entered application");
        assert_eq!(
            *log.lock().unwrap(),
            [
                Call::Init,
                Call::InitSecondary,
                Call::Teardown,
                Call::TeardownSecondary,
                Call::Jump,
            ]
        );
    }

    #[test]
    fn flash_protection_is_engaged_when_configured() {
        let (board, log) = MockBoard::valid_app();
        let config = BootConfig {
            double_tap: None,
            protect_bootloader: true,
        };
        let bootloader = Bootloader::<_, SharedReg>::new(board, None, config);

        run_to_panic(bootloader);

        assert_eq!(log.lock().unwrap()[2], Call::Protect);
    }

    #[test]
    fn invalid_app_enters_update_mode() {
        let (mut board, log) = MockBoard::valid_app();
        board.app_valid = false;
        let scratch = SharedReg::holding(Signal::Empty);
        let bootloader = Bootloader::new(
            board,
            Some(scratch.clone()),
            BootConfig::DEFAULT,
        );

        let marker = run_to_panic(bootloader);

        assert_eq!(marker, "entered update mode");
        // The register was never touched: safety precedes the gesture
        // protocol.
        assert!(scratch.writes().is_empty());
        assert!(!log.lock().unwrap().contains(&Call::Erase));
    }

    #[test]
    fn jump_returning_is_fatal() {
        let (mut board, log) = MockBoard::valid_app();
        board.jump_succeeds = false;
        let bootloader =
            Bootloader::<_, SharedReg>::new(board, None, NO_DETECTION);

        let marker = run_to_panic(bootloader);

        assert_eq!(marker, "application did not take control");
        assert_eq!(*log.lock().unwrap().last().unwrap(), Call::Jump);
    }

    #[test]
    fn erase_request_erases_once_before_update_mode() {
        let (board, log) = MockBoard::valid_app();
        let scratch = SharedReg::holding(Signal::EraseApp);
        let bootloader = Bootloader::new(
            board,
            Some(scratch.clone()),
            BootConfig::DEFAULT,
        );

        let marker = run_to_panic(bootloader);

        assert_eq!(marker, "entered update mode");
        let log = log.lock().unwrap();
        let erases =
            log.iter().filter(|&&call| call == Call::Erase).count();
        assert_eq!(erases, 1);
        assert_eq!(&log[log.len() - 2..], [Call::Erase, Call::Update]);
        assert_eq!(scratch.value(), 0);
    }

    #[test]
    fn pending_tap_enters_update_mode_without_erase() {
        let (board, log) = MockBoard::valid_app();
        let scratch = SharedReg::holding(Signal::TapPending);
        let bootloader = Bootloader::new(
            board,
            Some(scratch.clone()),
            BootConfig::DEFAULT,
        );

        let marker = run_to_panic(bootloader);

        assert_eq!(marker, "entered update mode");
        assert!(!log.lock().unwrap().contains(&Call::Erase));
        assert_eq!(scratch.value(), 0);
    }

    #[test]
    fn quick_boot_jumps_without_starting_the_timer() {
        let (board, log) = MockBoard::valid_app();
        let scratch = SharedReg::holding(Signal::QuickBoot);
        let bootloader = Bootloader::new(
            board,
            Some(scratch.clone()),
            BootConfig::DEFAULT,
        );

        let marker = run_to_panic(bootloader);

        assert_eq!(marker, "entered application");
        assert!(!log.lock().unwrap().contains(&Call::TimerStart));
        assert_eq!(scratch.value(), 0);
    }

    #[test]
    fn full_window_pass_arms_waits_and_jumps() {
        let (mut board, log) = MockBoard::valid_app();
        board.drive_ticks = true;
        let scratch = SharedReg::holding(Signal::Empty);
        let bootloader = Bootloader::new(
            board,
            Some(scratch.clone()),
            BootConfig::DEFAULT,
        );

        let marker = run_to_panic(bootloader);

        assert_eq!(marker, "entered application");
        assert_eq!(scratch.writes(), [TAP_PENDING_MAGIC, 0]);
        assert_eq!(scratch.value(), 0);

        let log = log.lock().unwrap();
        let started =
            log.iter().position(|&call| call == Call::TimerStart).unwrap();
        let stopped =
            log.iter().position(|&call| call == Call::TimerStop).unwrap();
        let jumped = log.iter().position(|&call| call == Call::Jump).unwrap();
        assert!(started < stopped && stopped < jumped);
    }
}
