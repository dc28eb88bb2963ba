use alloy::sol;

sol! {
    /// Emitted by the network contract for every executed trade.
    event ExecuteTrade(
        address indexed trader,
        address src,
        address dest,
        uint256 actualSrcAmount,
        uint256 actualDestAmount
    );

    /// Emitted by the fee burner when a reserve's burn fee is assigned.
    event AssignBurnFees(address reserve, uint256 burnFee);

    /// Emitted by the fee burner when a wallet's fee share is assigned.
    event AssignEtherShare(address wallet, uint256 walletFee);

    /// Emitted by the whitelist contract when an address is categorised.
    event UserCategorySet(address user, uint256 category);

    #[sol(rpc)]
    interface IWrapper {
        function getReserveRate(
            address reserve,
            address[] calldata srcs,
            address[] calldata dests
        ) external view returns (uint256[] memory rates, uint256[] memory sanityRates);
    }
}
