//! Bridge and token contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe event decoders and call
//! encoders. Only the subset the oracle touches is declared.

use alloy::sol;

sol! {
    /// Home side of the bridge: burns emit signature requests, validators
    /// affirm foreign-side transfers.
    contract HomeBridge {
        /// Emitted when a user asks to move tokens to the foreign chain
        event UserRequestForSignature(address recipient, uint256 value);

        /// Emitted once enough validators have signed a message on-chain
        event CollectedSignatures(
            address authorityResponsibleForRelay,
            bytes32 messageHash,
            uint256 NumberOfCollectedSignatures
        );

        /// Relay message stored for a collected message hash
        function message(bytes32 hash) external view returns (bytes memory);

        /// The `index`-th validator signature collected for a message hash
        function signature(bytes32 hash, uint256 index) external view returns (bytes memory);

        /// Mint on the home chain for a transfer observed on the foreign chain
        function executeAffirmation(address recipient, uint256 value, bytes32 transactionHash) external;
    }

    /// Foreign side of the bridge: releases tokens against validator signatures.
    contract ForeignBridge {
        /// Emitted when a user asks to move tokens to the home chain
        event UserRequestForAffirmation(address recipient, uint256 value);

        /// Release tokens on the foreign chain; `signatures` is the packed
        /// `count ‖ v[] ‖ r[] ‖ s[]` blob
        function executeSignatures(bytes message, bytes signatures) external;
    }

    /// Bridged ERC20 token on the foreign chain
    contract BridgeableToken {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}
