//! Lock Store: custody accounting for every supported asset

use super::token::TokenBook;
use crate::error::{BridgeError, BridgeResult};
use crate::events::LedgerEvent;
use crate::types::IntentId;

use alloy_primitives::Address;
use std::collections::{HashMap, HashSet};

/// Escrow custody held on the source ledger
#[derive(Debug, Clone)]
pub struct LockStore {
    /// Custody address that holds locked tokens
    address: Address,
    /// May change the asset allow-list
    owner: Address,
    /// May lock and unlock
    operator: Address,
    supported: HashSet<Address>,
    /// asset -> locked amount
    locked: HashMap<Address, u128>,
}

impl LockStore {
    pub fn new(address: Address, owner: Address, operator: Address) -> Self {
        Self {
            address,
            owner,
            operator,
            supported: HashSet::new(),
            locked: HashMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    pub fn add_supported_asset(
        &mut self,
        caller: Address,
        asset: Address,
    ) -> BridgeResult<LedgerEvent> {
        self.ensure_owner(caller, "add supported assets")?;
        self.supported.insert(asset);
        Ok(LedgerEvent::AssetSupportChanged {
            asset,
            supported: true,
        })
    }

    /// Remove an asset from the allow-list; balances already locked stay in custody
    pub fn remove_supported_asset(
        &mut self,
        caller: Address,
        asset: Address,
    ) -> BridgeResult<LedgerEvent> {
        self.ensure_owner(caller, "remove supported assets")?;
        self.supported.remove(&asset);
        Ok(LedgerEvent::AssetSupportChanged {
            asset,
            supported: false,
        })
    }

    /// Operator-initiated lock pulling `from`'s tokens via its allowance to the store
    #[allow(clippy::too_many_arguments)]
    pub fn lock(
        &mut self,
        tokens: &mut TokenBook,
        caller: Address,
        intent_id: &IntentId,
        asset: Address,
        from: Address,
        amount: u128,
        receiver_hint: &str,
        now: u64,
    ) -> BridgeResult<LedgerEvent> {
        self.ensure_operator(caller, "lock")?;
        self.take_custody(tokens, self.address, intent_id, asset, from, amount, receiver_hint, now)
    }

    /// Pull `amount` of `asset` from `from` into custody using `spender`'s allowance
    ///
    /// Also the path the Intent Registry uses when executing an intent. All
    /// validation happens before the token move, and the locked balance is only
    /// committed once the move succeeded.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn take_custody(
        &mut self,
        tokens: &mut TokenBook,
        spender: Address,
        intent_id: &IntentId,
        asset: Address,
        from: Address,
        amount: u128,
        receiver_hint: &str,
        now: u64,
    ) -> BridgeResult<LedgerEvent> {
        if !self.supported.contains(&asset) {
            return Err(BridgeError::UnsupportedAsset(asset));
        }
        if amount == 0 {
            return Err(BridgeError::InvalidAmount);
        }
        if receiver_hint.trim().is_empty() {
            return Err(BridgeError::InvalidReceiver);
        }
        let locked = self
            .locked_amount(asset)
            .checked_add(amount)
            .ok_or_else(|| BridgeError::Internal(format!("locked amount overflow for {}", asset)))?;

        tokens.transfer_from(asset, spender, from, self.address, amount)?;
        self.locked.insert(asset, locked);

        Ok(LedgerEvent::Locked {
            intent_id: intent_id.clone(),
            asset,
            from,
            receiver_hint: receiver_hint.to_string(),
            amount,
            timestamp: now,
        })
    }

    /// Release custody back out; the balance is decremented before the transfer
    #[allow(clippy::too_many_arguments)]
    pub fn unlock(
        &mut self,
        tokens: &mut TokenBook,
        caller: Address,
        intent_id: &IntentId,
        asset: Address,
        to: Address,
        amount: u128,
        now: u64,
    ) -> BridgeResult<LedgerEvent> {
        self.ensure_operator(caller, "unlock")?;
        if amount == 0 {
            return Err(BridgeError::InvalidAmount);
        }
        let locked = self.locked_amount(asset);
        if amount > locked {
            return Err(BridgeError::InsufficientLocked {
                asset,
                locked,
                requested: amount,
            });
        }

        self.locked.insert(asset, locked - amount);
        if let Err(e) = tokens.transfer(asset, self.address, to, amount) {
            // Custody did not move; restore the accounting so the call rejects as a whole.
            self.locked.insert(asset, locked);
            return Err(e);
        }

        Ok(LedgerEvent::Unlocked {
            intent_id: intent_id.clone(),
            asset,
            to,
            amount,
            timestamp: now,
        })
    }

    pub fn locked_amount(&self, asset: Address) -> u128 {
        self.locked.get(&asset).copied().unwrap_or(0)
    }

    pub fn is_supported(&self, asset: Address) -> bool {
        self.supported.contains(&asset)
    }

    fn ensure_owner(&self, caller: Address, action: &'static str) -> BridgeResult<()> {
        if caller != self.owner {
            return Err(BridgeError::Unauthorized { caller, action });
        }
        Ok(())
    }

    fn ensure_operator(&self, caller: Address, action: &'static str) -> BridgeResult<()> {
        if caller != self.operator {
            return Err(BridgeError::Unauthorized { caller, action });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE: Address = Address::repeat_byte(0x10);
    const OWNER: Address = Address::repeat_byte(0x11);
    const OPERATOR: Address = Address::repeat_byte(0x12);
    const USER: Address = Address::repeat_byte(0x13);
    const ASSET: Address = Address::repeat_byte(0xaa);

    fn setup(balance: u128) -> (LockStore, TokenBook) {
        let mut store = LockStore::new(STORE, OWNER, OPERATOR);
        store.add_supported_asset(OWNER, ASSET).unwrap();
        let mut tokens = TokenBook::new();
        tokens.mint(ASSET, USER, balance).unwrap();
        tokens.approve(ASSET, USER, STORE, balance);
        (store, tokens)
    }

    fn id(value: &str) -> IntentId {
        IntentId::from(value)
    }

    #[test]
    fn test_lock_moves_custody_and_emits() {
        let (mut store, mut tokens) = setup(1_000);
        let event = store
            .lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 400, "alice.near", 7)
            .unwrap();

        assert_eq!(store.locked_amount(ASSET), 400);
        assert_eq!(tokens.balance_of(ASSET, STORE), 400);
        assert_eq!(tokens.balance_of(ASSET, USER), 600);
        assert_eq!(
            event,
            LedgerEvent::Locked {
                intent_id: id("1"),
                asset: ASSET,
                from: USER,
                receiver_hint: "alice.near".to_string(),
                amount: 400,
                timestamp: 7,
            }
        );
    }

    #[test]
    fn test_lock_validation_errors() {
        let (mut store, mut tokens) = setup(1_000);
        let other = Address::repeat_byte(0xbb);

        assert!(matches!(
            store.lock(&mut tokens, OPERATOR, &id("1"), other, USER, 1, "a.near", 0),
            Err(BridgeError::UnsupportedAsset(_))
        ));
        assert!(matches!(
            store.lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 0, "a.near", 0),
            Err(BridgeError::InvalidAmount)
        ));
        assert!(matches!(
            store.lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 1, "", 0),
            Err(BridgeError::InvalidReceiver)
        ));
        assert!(matches!(
            store.lock(&mut tokens, USER, &id("1"), ASSET, USER, 1, "a.near", 0),
            Err(BridgeError::Unauthorized { .. })
        ));
        assert_eq!(store.locked_amount(ASSET), 0);
    }

    #[test]
    fn test_failed_pull_leaves_accounting_untouched() {
        let (mut store, mut tokens) = setup(100);
        let err = store
            .lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 101, "a.near", 0)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InsufficientAuthorization { .. }));
        assert_eq!(store.locked_amount(ASSET), 0);
        assert_eq!(tokens.balance_of(ASSET, USER), 100);
    }

    #[test]
    fn test_unlock_never_goes_negative() {
        let (mut store, mut tokens) = setup(1_000);
        store
            .lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 300, "a.near", 0)
            .unwrap();

        let err = store
            .unlock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 301, 0)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InsufficientLocked { locked: 300, requested: 301, .. }));

        store
            .unlock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 300, 0)
            .unwrap();
        assert_eq!(store.locked_amount(ASSET), 0);
        assert_eq!(tokens.balance_of(ASSET, USER), 1_000);
    }

    #[test]
    fn test_only_operator_unlocks() {
        let (mut store, mut tokens) = setup(1_000);
        store
            .lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 300, "a.near", 0)
            .unwrap();

        for caller in [USER, OWNER] {
            let err = store
                .unlock(&mut tokens, caller, &id("1"), ASSET, caller, 100, 0)
                .unwrap_err();
            assert!(matches!(err, BridgeError::Unauthorized { action: "unlock", .. }));
        }
        assert_eq!(store.locked_amount(ASSET), 300);
        assert_eq!(tokens.balance_of(ASSET, STORE), 300);
        assert_eq!(tokens.balance_of(ASSET, USER), 700);
    }

    #[test]
    fn test_unlock_rolls_back_when_custody_is_short() {
        let (mut store, mut tokens) = setup(1_000);
        store
            .lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 300, "a.near", 0)
            .unwrap();
        // Drain custody behind the store's back.
        tokens.transfer(ASSET, STORE, USER, 300).unwrap();

        assert!(store
            .unlock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 100, 0)
            .is_err());
        assert_eq!(store.locked_amount(ASSET), 300);
    }

    #[test]
    fn test_removing_asset_keeps_locked_balance() {
        let (mut store, mut tokens) = setup(1_000);
        store
            .lock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 250, "a.near", 0)
            .unwrap();
        assert!(store.remove_supported_asset(OPERATOR, ASSET).is_err());
        store.remove_supported_asset(OWNER, ASSET).unwrap();

        assert!(!store.is_supported(ASSET));
        assert_eq!(store.locked_amount(ASSET), 250);
        // Existing custody can still be released.
        store
            .unlock(&mut tokens, OPERATOR, &id("1"), ASSET, USER, 250, 0)
            .unwrap();
    }

    #[test]
    fn test_locked_amount_tracks_lock_minus_unlock() {
        let (mut store, mut tokens) = setup(10_000);
        let ops: [(bool, u128); 7] = [
            (true, 500),
            (true, 1_200),
            (false, 700),
            (false, 2_000),
            (true, 30),
            (false, 1_030),
            (false, 1),
        ];
        let mut expected: u128 = 0;
        for (i, (is_lock, amount)) in ops.iter().enumerate() {
            let intent = id(&i.to_string());
            // Rejected calls (over-unlocks) must leave the balance unchanged.
            let _ = if *is_lock {
                store
                    .lock(&mut tokens, OPERATOR, &intent, ASSET, USER, *amount, "a.near", 0)
                    .map(|_| expected += amount)
            } else {
                store
                    .unlock(&mut tokens, OPERATOR, &intent, ASSET, USER, *amount, 0)
                    .map(|_| expected -= amount)
            };
            assert_eq!(store.locked_amount(ASSET), expected);
        }
        assert_eq!(expected, 0);
        assert_eq!(tokens.balance_of(ASSET, STORE), 0);
    }
}
