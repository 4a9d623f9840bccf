// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_fwu_api::{
    BankFlash, BankState, FwuError, Metadata, MetadataStore, UpdatePhase,
    Uuid,
};
use drv_fwu_mdata_store::{MirroredStore, SliceFlash, StoreLayout};
use drv_fwu_update_server::ServerImpl;
use fwu_bank::{BankSelector, BootDecision, TrialTracker};
use sha3::{Digest, Sha3_256};

const BLOCK: usize = 64;
const BLOCKS: usize = 8;
const SECTOR: usize = 1024;
const LAYOUT: StoreLayout = StoreLayout {
    primary: 0,
    secondary: SECTOR as u32,
};

const FIRMWARE: Uuid = [0x10; 16];
const LOADER: Uuid = [0x20; 16];

struct RamBanks {
    banks: Vec<Vec<u8>>,
    fail_erase: bool,
}

impl RamBanks {
    fn new(n: usize) -> Self {
        Self {
            banks: vec![vec![0xff; BLOCK * BLOCKS]; n],
            fail_erase: false,
        }
    }
}

impl BankFlash for RamBanks {
    fn block_size(&self) -> usize {
        BLOCK
    }

    fn bank_blocks(&self) -> usize {
        BLOCKS
    }

    fn erase_bank(&mut self, bank: u32) -> Result<(), FwuError> {
        if self.fail_erase {
            return Err(FwuError::FlashError);
        }
        self.banks[bank as usize].fill(0xff);
        Ok(())
    }

    fn write_block(
        &mut self,
        bank: u32,
        block: usize,
        data: &[u8],
    ) -> Result<(), FwuError> {
        let start = block * BLOCK;
        self.banks[bank as usize][start..start + data.len()]
            .copy_from_slice(data);
        Ok(())
    }

    fn digest(&mut self, bank: u32, len: usize) -> Result<[u8; 32], FwuError> {
        Ok(Sha3_256::digest(&self.banks[bank as usize][..len]).into())
    }
}

/// A store that can be told to fail, wrapping the real mirrored store.
struct Flaky<S> {
    inner: S,
    fail_reads: bool,
    fail_writes: bool,
    reads: usize,
    writes: usize,
}

impl<S: MetadataStore> MetadataStore for Flaky<S> {
    fn read(&mut self) -> Result<Metadata, FwuError> {
        self.reads += 1;
        if self.fail_reads {
            return Err(FwuError::FlashError);
        }
        self.inner.read()
    }

    fn write(&mut self, mdata: &Metadata) -> Result<(), FwuError> {
        self.writes += 1;
        if self.fail_writes {
            return Err(FwuError::PersistFailed);
        }
        self.inner.write(mdata)
    }
}

fn provisioned(dev: &mut [u8], active: u32) {
    let mut m = Metadata::new(2, 2).unwrap();
    m.images[0].image_type_uuid = FIRMWARE;
    m.images[1].image_type_uuid = LOADER;
    m.active_index = active;
    for img in m.images_mut() {
        img.banks[active as usize].accepted = true;
    }
    m.bank_state[active as usize] = BankState::Accepted;
    let mut store = MirroredStore::new(SliceFlash(dev), LAYOUT).unwrap();
    store.write(&m).unwrap();
}

fn server(
    dev: &mut [u8],
    boot_index: u32,
) -> ServerImpl<Flaky<MirroredStore<SliceFlash<'_>>>, RamBanks> {
    let store = Flaky {
        inner: MirroredStore::new(SliceFlash(dev), LAYOUT).unwrap(),
        fail_reads: false,
        fail_writes: false,
        reads: 0,
        writes: 0,
    };
    ServerImpl::new(
        store,
        RamBanks::new(2),
        BankSelector::new(2).unwrap(),
        boot_index,
    )
}

fn image() -> Vec<u8> {
    (0..BLOCK * 3 + 10).map(|i| (i * 7) as u8).collect()
}

fn stage(
    srv: &mut ServerImpl<impl MetadataStore, impl BankFlash>,
    img: &[u8],
) {
    for (n, chunk) in img.chunks(srv.block_size()).enumerate() {
        srv.write_one_block(n, chunk).unwrap();
    }
}

fn digest(img: &[u8]) -> [u8; 32] {
    Sha3_256::digest(img).into()
}

fn stored(dev: &mut [u8]) -> Metadata {
    MirroredStore::new(SliceFlash(dev), LAYOUT)
        .unwrap()
        .read()
        .unwrap()
}

#[test]
fn full_update_commits_to_other_bank() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);
    let img = image();

    let mut srv = server(&mut dev, 0);
    assert_eq!(srv.prep_image_update(), Ok(1));
    assert_eq!(
        srv.status().unwrap().phase,
        UpdatePhase::Staging { target: 1 }
    );
    stage(&mut srv, &img);
    assert_eq!(srv.finish_image_update(img.len(), &digest(&img)), Ok(()));

    let status = srv.status().unwrap();
    assert_eq!(status.phase, UpdatePhase::Idle);
    assert_eq!(status.active_index, 1);
    assert_eq!(status.previous_active_index, 0);
    assert!(status.trial);
    assert_eq!(status.bank_state[1], BankState::Valid);

    let (_, banks) = srv.into_parts();
    assert_eq!(&banks.banks[1][..img.len()], &img[..]);

    let m = stored(&mut dev);
    assert_eq!(m.active_index, 1);
    assert_eq!(m.previous_active_index, 0);
}

#[test]
fn bad_digest_keeps_staging_and_metadata() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 1);
    let before = stored(&mut dev);
    let img = image();

    let mut srv = server(&mut dev, 1);
    assert_eq!(srv.prep_image_update(), Ok(0));
    stage(&mut srv, &img);
    assert_eq!(
        srv.finish_image_update(img.len(), &[0u8; 32]),
        Err(FwuError::VerifyFailed)
    );
    assert_eq!(
        srv.status().unwrap().phase,
        UpdatePhase::Staging { target: 0 }
    );
    assert_eq!(srv.abort_update(), Ok(()));
    assert_eq!(srv.status().unwrap().phase, UpdatePhase::Idle);
    drop(srv);

    assert_eq!(stored(&mut dev), before);
}

#[test]
fn session_ordering_errors() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);

    let mut srv = server(&mut dev, 0);
    assert_eq!(srv.abort_update(), Err(FwuError::UpdateNotStarted));
    assert_eq!(
        srv.write_one_block(0, &[0; BLOCK]),
        Err(FwuError::UpdateNotStarted)
    );
    assert_eq!(
        srv.finish_image_update(BLOCK, &[0; 32]),
        Err(FwuError::UpdateNotStarted)
    );

    srv.prep_image_update().unwrap();
    assert_eq!(srv.prep_image_update(), Err(FwuError::UpdateInProgress));
    assert_eq!(
        srv.write_one_block(0, &[0; BLOCK + 1]),
        Err(FwuError::BadLength)
    );
    assert_eq!(srv.write_one_block(0, &[]), Err(FwuError::BadLength));
    assert_eq!(
        srv.write_one_block(BLOCKS, &[0; BLOCK]),
        Err(FwuError::OutOfBounds)
    );
    // Nothing written yet, so there is nothing to verify.
    assert_eq!(
        srv.finish_image_update(BLOCK, &[0; 32]),
        Err(FwuError::BadLength)
    );
}

#[test]
fn persist_failure_leaves_old_bank_active() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);
    let img = image();

    let mut srv = server(&mut dev, 0);
    srv.prep_image_update().unwrap();
    stage(&mut srv, &img);

    let (mut store, banks) = srv.into_parts();
    store.fail_writes = true;
    let mut srv =
        ServerImpl::new(store, banks, BankSelector::new(2).unwrap(), 0);
    // A fresh server knows nothing of the old session.
    assert_eq!(
        srv.finish_image_update(img.len(), &digest(&img)),
        Err(FwuError::UpdateNotStarted)
    );
    srv.prep_image_update().unwrap();
    stage(&mut srv, &img);
    assert_eq!(
        srv.finish_image_update(img.len(), &digest(&img)),
        Err(FwuError::PersistFailed)
    );
    assert_eq!(srv.status().unwrap().phase, UpdatePhase::Idle);
    drop(srv);

    assert_eq!(stored(&mut dev).active_index, 0);
}

#[test]
fn unreadable_metadata_is_an_index_fetch_failure() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);

    let (mut store, banks) = server(&mut dev, 0).into_parts();
    store.fail_reads = true;
    let mut srv =
        ServerImpl::new(store, banks, BankSelector::new(2).unwrap(), 0);
    assert_eq!(
        srv.prep_image_update(),
        Err(FwuError::ActiveIndexFetchFailed)
    );
}

#[test]
fn blank_metadata_is_an_index_fetch_failure() {
    let mut dev = vec![0xff; 2 * SECTOR];
    let mut srv = server(&mut dev, 0);
    assert_eq!(
        srv.prep_image_update(),
        Err(FwuError::ActiveIndexFetchFailed)
    );
}

#[test]
fn out_of_range_active_index_is_invalid_metadata() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);
    let mut m = stored(&mut dev);
    m.active_index = 3;
    MirroredStore::new(SliceFlash(&mut dev), LAYOUT)
        .unwrap()
        .write(&m)
        .unwrap();

    let mut srv = server(&mut dev, 0);
    assert_eq!(srv.prep_image_update(), Err(FwuError::InvalidMetadata));
}

#[test]
fn erase_failure_does_not_start_session() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);

    let (store, mut banks) = server(&mut dev, 0).into_parts();
    banks.fail_erase = true;
    let mut srv =
        ServerImpl::new(store, banks, BankSelector::new(2).unwrap(), 0);
    assert_eq!(srv.prep_image_update(), Err(FwuError::FlashError));
    assert_eq!(srv.abort_update(), Err(FwuError::UpdateNotStarted));
}

#[test]
fn trial_bank_must_be_accepted_before_next_update() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);
    let img = image();

    let mut srv = server(&mut dev, 0);
    srv.prep_image_update().unwrap();
    stage(&mut srv, &img);
    srv.finish_image_update(img.len(), &digest(&img)).unwrap();
    drop(srv);

    // Reboot into the new bank.
    let mut srv = server(&mut dev, 1);
    assert_eq!(srv.prep_image_update(), Err(FwuError::TrialState));

    srv.accept_image(&FIRMWARE).unwrap();
    assert!(srv.status().unwrap().trial);
    srv.accept_image(&LOADER).unwrap();
    let status = srv.status().unwrap();
    assert!(!status.trial);
    assert_eq!(status.bank_state[1], BankState::Accepted);

    assert_eq!(srv.prep_image_update(), Ok(0));
}

#[test]
fn running_from_wrong_bank_refuses_update() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);
    let mut srv = server(&mut dev, 1);
    assert_eq!(
        srv.prep_image_update(),
        Err(FwuError::NotBootedFromActive)
    );
}

#[test]
fn exhausted_trial_reverts() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);
    let img = image();

    let mut srv = server(&mut dev, 0);
    srv.prep_image_update().unwrap();
    stage(&mut srv, &img);
    srv.finish_image_update(img.len(), &digest(&img)).unwrap();
    drop(srv);

    let tracker = TrialTracker::new(1).unwrap();
    let mut srv = server(&mut dev, 1);
    let first = srv.boot_check(&tracker, 0).unwrap();
    assert_eq!(first.decision, BootDecision::Trial { attempt: 1 });

    let second = srv.boot_check(&tracker, first.counter).unwrap();
    assert!(matches!(second.decision, BootDecision::Revert(_)));
    drop(srv);

    let m = stored(&mut dev);
    assert_eq!(m.active_index, 0);
    assert_eq!(m.previous_active_index, 1);

    // Back on the accepted bank, nothing to track.
    let mut srv = server(&mut dev, 0);
    let third = srv.boot_check(&tracker, second.counter).unwrap();
    assert_eq!(third.decision, BootDecision::Normal);
}

#[test]
fn update_reads_and_writes_record_once() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 0);
    let img = image();

    let mut srv = server(&mut dev, 0);
    srv.prep_image_update().unwrap();
    stage(&mut srv, &img);
    srv.finish_image_update(img.len(), &digest(&img)).unwrap();

    let (store, _) = srv.into_parts();
    assert_eq!((store.reads, store.writes), (1, 1));
    drop(store);

    assert_eq!(stored(&mut dev).active_index, 1);
}

#[test]
fn record_with_other_bank_count_is_refused() {
    let mut dev = vec![0xff; 2 * SECTOR];
    provisioned(&mut dev, 1);

    let (store, _) = server(&mut dev, 1).into_parts();
    // Three banks on the platform, but the record only describes two: the
    // next bank after 1 would be one the record knows nothing about.
    let mut srv = ServerImpl::new(
        store,
        RamBanks::new(3),
        BankSelector::new(3).unwrap(),
        1,
    );
    assert_eq!(srv.prep_image_update(), Err(FwuError::InvalidMetadata));
    assert_eq!(srv.abort_update(), Err(FwuError::UpdateNotStarted));
    drop(srv);

    let m = stored(&mut dev);
    assert_eq!((m.num_banks, m.active_index), (2, 1));
}
